use ctype::{
    Abi, Extend, Fixup, FunctionLayout, FunctionSignature, Location, ParamLayout, PassMode,
    Piece, PrimitiveKind, ReturnLayout, TypeDescriptor,
};

use super::{
    Classifier, FrameShape,
    classes::{Hfa, hfa},
    finish, register_run, scalar_extend, stack_piece,
};
use crate::AlienResult;

/// Platform variants of AAPCS64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Standard,
    /// Darwin: natural stack alignment, variadics always on the stack.
    Apple,
    /// Windows: variadic floats travel in general registers.
    Windows,
    /// Arm64EC: variadic calls follow the x64 slot scheme.
    Ec,
}

pub struct Arm64 {
    pub flavor: Flavor,
}

const ARG_REGS: u8 = 8;
/// x8, the indirect result register.
const RESULT_REG: u8 = 8;

struct State {
    ngrn: u8,
    nsrn: u8,
    nsaa: u32,
    apple: bool,
}

impl State {
    fn push_stack(&mut self, size: u32, align: u32, extend: Extend, natural: bool) -> Piece {
        let piece = if natural {
            self.nsaa = self.nsaa.next_multiple_of(align.max(1));
            Piece::widened(0, size, Location::Stack(self.nsaa), extend, size)
        } else {
            self.nsaa = self.nsaa.next_multiple_of(align.max(8));
            stack_piece(size, self.nsaa, 8, extend)
        };
        self.nsaa += piece.width;
        piece
    }

    fn place_scalar(&mut self, layout: &mut ParamLayout, ty: &TypeDescriptor, extend: Extend) {
        let size = ty.size() as u32;
        if self.ngrn < ARG_REGS {
            layout
                .pieces
                .push(Piece::widened(0, size, Location::Gpr(self.ngrn), extend, 8));
            layout.gpr_count = 1;
            self.ngrn += 1;
        } else {
            let piece = self.push_stack(size, ty.align() as u32, extend, self.apple);
            layout.stack_bytes = piece.width;
            layout.pieces.push(piece);
        }
    }

    fn place_float(&mut self, layout: &mut ParamLayout, ty: &TypeDescriptor, extend: Extend) {
        let size = ty.size() as u32;
        if self.nsrn < ARG_REGS {
            layout
                .pieces
                .push(Piece::widened(0, size, Location::Vec(self.nsrn), extend, 8));
            layout.vec_count = 1;
            self.nsrn += 1;
        } else {
            let piece = self.push_stack(size, ty.align() as u32, extend, self.apple);
            layout.stack_bytes = piece.width;
            layout.pieces.push(piece);
        }
    }

    fn place_hfa(&mut self, layout: &mut ParamLayout, ty: &TypeDescriptor, fa: Hfa) {
        let count = fa.count as u8;
        if self.nsrn + count <= ARG_REGS {
            let esize = fa.element_size();
            layout.pieces = (0..fa.count)
                .map(|i| Piece::raw(i * esize, esize, Location::Vec(self.nsrn + i as u8)))
                .collect();
            layout.vec_count = count;
            self.nsrn += count;
        } else {
            self.nsrn = ARG_REGS;
            let piece = self.push_stack(ty.size() as u32, ty.align() as u32, Extend::None, false);
            layout.stack_bytes = piece.width;
            layout.pieces.push(piece);
        }
    }

    /// Composites of at most 16 bytes: consecutive general registers or
    /// the stack, split between x7 and the stack only when `split` is set.
    fn place_composite(&mut self, layout: &mut ParamLayout, ty: &TypeDescriptor, split: bool) {
        let size = ty.size() as u32;
        let align = ty.align() as u32;
        if align >= 16 {
            self.ngrn = self.ngrn.next_multiple_of(2);
        }
        let regs = size.div_ceil(8) as u8;
        if self.ngrn + regs <= ARG_REGS {
            layout.pieces = register_run(0, size, 8, self.ngrn, Location::Gpr);
            layout.gpr_count = regs;
            self.ngrn += regs;
        } else if split && self.ngrn < ARG_REGS {
            let in_regs = u32::from(ARG_REGS - self.ngrn) * 8;
            layout.pieces = register_run(0, in_regs, 8, self.ngrn, Location::Gpr);
            layout.gpr_count = ARG_REGS - self.ngrn;
            self.ngrn = ARG_REGS;
            self.nsaa = self.nsaa.next_multiple_of(8);
            let rest = size - in_regs;
            layout.pieces.push(Piece::widened(
                in_regs,
                rest,
                Location::Stack(self.nsaa),
                Extend::None,
                rest.next_multiple_of(8),
            ));
            layout.stack_bytes = rest.next_multiple_of(8);
            self.nsaa += layout.stack_bytes;
        } else {
            self.ngrn = ARG_REGS;
            let piece = self.push_stack(size, align, Extend::None, false);
            layout.stack_bytes = piece.width;
            layout.pieces.push(piece);
        }
    }

    /// Large composites travel as the address of a scratch copy.
    fn place_indirect(&mut self, layout: &mut ParamLayout) {
        layout.mode = PassMode::Indirect;
        layout.use_memory = true;
        if self.ngrn < ARG_REGS {
            layout.pieces.push(Piece::raw(0, 8, Location::Gpr(self.ngrn)));
            layout.gpr_count = 1;
            self.ngrn += 1;
        } else {
            let piece = self.push_stack(8, 8, Extend::None, false);
            layout.stack_bytes = piece.width;
            layout.pieces.push(piece);
        }
    }
}

fn return_layout(ret: &TypeDescriptor) -> ReturnLayout {
    let kind = ret.kind();
    let size = ret.size() as u32;
    if kind == PrimitiveKind::Void || size == 0 {
        return ReturnLayout {
            mode: PassMode::Ignore,
            ..ReturnLayout::default()
        };
    }
    let direct = |pieces| ReturnLayout {
        mode: PassMode::Direct,
        hidden: None,
        pieces,
    };
    if kind.is_float() {
        return direct(vec![Piece::raw(0, size, Location::Vec(0))]);
    }
    if let Some(fa) = hfa(ret) {
        let esize = fa.element_size();
        return direct(
            (0..fa.count)
                .map(|i| Piece::raw(i * esize, esize, Location::Vec(i as u8)))
                .collect(),
        );
    }
    if kind.is_aggregate() && size > 16 {
        return ReturnLayout {
            mode: PassMode::Indirect,
            hidden: Some(Location::Gpr(RESULT_REG)),
            pieces: Vec::new(),
        };
    }
    if size > 8 {
        direct(vec![
            Piece::raw(0, 8, Location::Gpr(0)),
            Piece::raw(8, size - 8, Location::Gpr(1)),
        ])
    } else {
        direct(vec![Piece::raw(0, size, Location::Gpr(0))])
    }
}

impl Arm64 {
    fn abi_tag(&self) -> Abi {
        match self.flavor {
            Flavor::Standard => Abi::Arm64,
            Flavor::Apple => Abi::Arm64Apple,
            Flavor::Windows => Abi::Arm64Windows,
            Flavor::Ec => Abi::Arm64Ec,
        }
    }

    /// Arm64EC variadic calls: argument i takes x{i} for i < 4 and the
    /// 8-byte stack slot i - 4 otherwise. x4 and x5 carry the stack
    /// address and size for the x64 side.
    fn classify_ec_variadic(&self, sig: &FunctionSignature, ret: ReturnLayout) -> FunctionLayout {
        let mut params = Vec::with_capacity(sig.params.len());
        let mut slot = 0u32;
        for param in &sig.params {
            let ty = &param.ty;
            let kind = ty.kind();
            let mut layout = ParamLayout::default();
            let by_value = !kind.is_aggregate() || matches!(ty.size(), 1 | 2 | 4 | 8);
            let (len, extend) = if !by_value {
                layout.mode = PassMode::Indirect;
                layout.use_memory = true;
                (8, Extend::None)
            } else if kind == PrimitiveKind::Float32 && param.variadic {
                (4, Extend::Promote)
            } else if kind.is_float() || kind.is_aggregate() {
                (ty.size() as u32, Extend::None)
            } else {
                (ty.size() as u32, scalar_extend(ty))
            };
            let dest = if slot < 4 {
                layout.gpr_count = 1;
                Location::Gpr(slot as u8)
            } else {
                layout.stack_bytes = 8;
                Location::Stack(8 * (slot - 4))
            };
            layout.pieces.push(Piece::widened(0, len, dest, extend, 8));
            slot += 1;
            params.push(layout);
        }
        let stack = 8 * slot.saturating_sub(4);
        let mut layout = finish(Abi::Arm64Ec, params, ret, stack);
        layout.fixups = vec![Fixup::StackAddress(4), Fixup::StackSize(5)];
        layout
    }
}

impl Classifier for Arm64 {
    fn abi(&self) -> Abi {
        self.abi_tag()
    }

    fn shape(&self) -> FrameShape {
        FrameShape {
            gpr_count: ARG_REGS + 1,
            gpr_slot: 8,
            vec_count: ARG_REGS,
            vec_slot: 8,
            stack_slot: 8,
            shadow: 0,
        }
    }

    fn classify(&self, sig: &FunctionSignature) -> AlienResult<FunctionLayout> {
        let ret = return_layout(&sig.ret);
        if self.flavor == Flavor::Ec && sig.variadic {
            return Ok(self.classify_ec_variadic(sig, ret));
        }

        let mut st = State {
            ngrn: 0,
            nsrn: 0,
            nsaa: 0,
            apple: self.flavor == Flavor::Apple,
        };
        let mut params = Vec::with_capacity(sig.params.len());
        for param in &sig.params {
            let ty = &param.ty;
            let kind = ty.kind();
            let size = ty.size() as u32;
            let mut layout = ParamLayout::default();

            if size == 0 {
                params.push(ParamLayout::ignored());
                continue;
            }
            let promote = param.variadic && kind == PrimitiveKind::Float32;
            let float_extend = if promote { Extend::Promote } else { Extend::None };

            if param.variadic && self.flavor == Flavor::Apple {
                // every variadic argument gets its own 8-byte slot
                let (len, extend) = if kind.is_aggregate() && size > 16 && hfa(ty).is_none() {
                    layout.mode = PassMode::Indirect;
                    layout.use_memory = true;
                    (8, Extend::None)
                } else if kind.is_float() {
                    (size, float_extend)
                } else if kind.is_aggregate() {
                    (size, Extend::None)
                } else {
                    (size, scalar_extend(ty))
                };
                let piece = st.push_stack(len, ty.align() as u32, extend, false);
                layout.stack_bytes = piece.width;
                layout.pieces.push(piece);
            } else if kind.is_float() {
                if param.variadic && self.flavor == Flavor::Windows {
                    st.place_scalar(&mut layout, ty, float_extend);
                } else {
                    st.place_float(&mut layout, ty, float_extend);
                }
            } else if !kind.is_aggregate() {
                st.place_scalar(&mut layout, ty, scalar_extend(ty));
            } else if let Some(fa) = hfa(ty)
                && !(param.variadic && self.flavor == Flavor::Windows)
            {
                st.place_hfa(&mut layout, ty, fa);
            } else if size > 16 {
                st.place_indirect(&mut layout);
            } else {
                let split = param.variadic && self.flavor == Flavor::Windows;
                st.place_composite(&mut layout, ty, split);
            }
            params.push(layout);
        }

        Ok(finish(self.abi_tag(), params, ret, st.nsaa))
    }

    fn register_name(&self, loc: Location) -> String {
        match loc {
            Location::Gpr(i) => format!("x{i}"),
            Location::Vec(i) => format!("v{i}"),
            Location::Stack(off) => format!("[sp+{off}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{
        classify,
        tests::{prim, record, reg},
    };
    use ctype::ForwardKind;

    #[test]
    fn hfas_take_consecutive_vector_registers() {
        let mut r = reg(Abi::Arm64);
        let triple = record(&mut r, &[PrimitiveKind::Float32; 3]);
        let pair = record(&mut r, &[PrimitiveKind::Float64; 2]);
        let f64_ = prim(&mut r, PrimitiveKind::Float64);
        let sig = FunctionSignature::new("f", pair).param(f64_).param(triple);
        let layout = classify(Abi::Arm64, &sig).expect("classify");
        let dests: Vec<_> = layout.params[1].pieces.iter().map(|p| p.dest).collect();
        assert_eq!(dests, vec![Location::Vec(1), Location::Vec(2), Location::Vec(3)]);
        assert_eq!(layout.params[1].pieces[2].src, 8);
        assert_eq!(layout.forward, ForwardKind::VecPair);
        assert_eq!(layout.vec_used, 4);
    }

    #[test]
    fn large_results_use_x8_without_consuming_x0() {
        let mut r = reg(Abi::Arm64);
        let big = record(&mut r, &[PrimitiveKind::Int64; 3]);
        let i32_ = prim(&mut r, PrimitiveKind::Int32);
        let sig = FunctionSignature::new("f", big.clone()).param(i32_).param(big);
        let layout = classify(Abi::Arm64, &sig).expect("classify");
        assert_eq!(layout.ret.hidden, Some(Location::Gpr(8)));
        assert_eq!(layout.params[0].pieces[0].dest, Location::Gpr(0));
        assert_eq!(layout.params[1].mode, PassMode::Indirect);
        assert_eq!(layout.params[1].pieces[0].dest, Location::Gpr(1));
        assert_eq!(Arm64 { flavor: Flavor::Standard }.register_name(Location::Gpr(8)), "x8");
    }

    #[test]
    fn composites_never_split_between_registers_and_stack() {
        let mut r = reg(Abi::Arm64);
        let i64_ = prim(&mut r, PrimitiveKind::Int64);
        let pair = record(&mut r, &[PrimitiveKind::Int64; 2]);
        let void = prim(&mut r, PrimitiveKind::Void);
        let mut sig = FunctionSignature::new("f", void);
        for _ in 0..7 {
            sig = sig.param(i64_.clone());
        }
        sig = sig.param(pair).param(i64_);
        let layout = classify(Abi::Arm64, &sig).expect("classify");
        assert_eq!(layout.params[7].pieces[0].dest, Location::Stack(0));
        assert_eq!(layout.params[8].pieces[0].dest, Location::Stack(16));
        assert_eq!(layout.args_size, 32);
    }

    #[test]
    fn apple_packs_stack_arguments_naturally() {
        let mut r = reg(Abi::Arm64Apple);
        let i8_ = prim(&mut r, PrimitiveKind::Int8);
        let i16_ = prim(&mut r, PrimitiveKind::Int16);
        let void = prim(&mut r, PrimitiveKind::Void);
        let mut sig = FunctionSignature::new("f", void);
        for _ in 0..9 {
            sig = sig.param(i8_.clone());
        }
        sig = sig.param(i16_);
        let layout = classify(Abi::Arm64Apple, &sig).expect("classify");
        assert_eq!(layout.params[8].pieces[0], Piece::widened(0, 1, Location::Stack(0), Extend::Sign, 1));
        assert_eq!(layout.params[9].pieces[0].dest, Location::Stack(2));
    }

    #[test]
    fn apple_variadics_go_on_the_stack() {
        let mut r = reg(Abi::Arm64Apple);
        let ptr = prim(&mut r, PrimitiveKind::Pointer);
        let int = prim(&mut r, PrimitiveKind::Int32);
        let f32_ = prim(&mut r, PrimitiveKind::Float32);
        let sig = FunctionSignature::new("printf", int.clone())
            .param(ptr)
            .variadic()
            .with_variadic(&[int, f32_]);
        let layout = classify(Abi::Arm64Apple, &sig).expect("classify");
        assert_eq!(layout.params[0].pieces[0].dest, Location::Gpr(0));
        assert_eq!(layout.params[1].pieces[0].dest, Location::Stack(0));
        let promoted = layout.params[2].pieces[0];
        assert_eq!(promoted.dest, Location::Stack(8));
        assert_eq!(promoted.extend, Extend::Promote);
        assert_eq!(layout.args_size, 16);
    }

    #[test]
    fn windows_variadic_floats_use_general_registers() {
        let mut r = reg(Abi::Arm64Windows);
        let ptr = prim(&mut r, PrimitiveKind::Pointer);
        let f64_ = prim(&mut r, PrimitiveKind::Float64);
        let int = prim(&mut r, PrimitiveKind::Int32);
        let sig = FunctionSignature::new("printf", int)
            .param(ptr)
            .variadic()
            .with_variadic(&[f64_]);
        let layout = classify(Abi::Arm64Windows, &sig).expect("classify");
        assert_eq!(layout.params[1].pieces[0].dest, Location::Gpr(1));
        assert_eq!(layout.vec_used, 0);
    }

    #[test]
    fn ec_variadics_follow_x64_slots() {
        let mut r = reg(Abi::Arm64Ec);
        let ptr = prim(&mut r, PrimitiveKind::Pointer);
        let f64_ = prim(&mut r, PrimitiveKind::Float64);
        let odd = record(&mut r, &[PrimitiveKind::Int8; 3]);
        let int = prim(&mut r, PrimitiveKind::Int32);
        let sig = FunctionSignature::new("printf", int.clone())
            .param(ptr)
            .variadic()
            .with_variadic(&[f64_, odd, int.clone(), int.clone(), int]);
        let layout = classify(Abi::Arm64Ec, &sig).expect("classify");
        assert_eq!(layout.params[1].pieces[0].dest, Location::Gpr(1));
        assert_eq!(layout.params[2].mode, PassMode::Indirect);
        assert_eq!(layout.params[4].pieces[0].dest, Location::Stack(0));
        assert_eq!(layout.params[5].pieces[0].dest, Location::Stack(8));
        assert_eq!(layout.fixups, vec![Fixup::StackAddress(4), Fixup::StackSize(5)]);
        assert_eq!(layout.args_size, 16);
    }
}
