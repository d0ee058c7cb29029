use ctype::{
    Abi, Extend, FunctionLayout, FunctionSignature, Location, ParamLayout, PassMode, Piece,
    PrimitiveKind, ReturnLayout, TypeDescriptor,
};

use super::{
    Classifier, FrameShape,
    classes::{Field, flatten},
    finish, register_run, scalar_extend, stack_piece,
};
use crate::AlienResult;

/// RV64 LP64D: a0-a7 and fa0-fa7.
pub struct RiscV64;

const ARG_REGS: u8 = 8;

struct State {
    gpr: u8,
    fpr: u8,
    stack: u32,
}

/// Integers are widened to XLEN by sign of the C type, except that
/// 32-bit unsigned values are sign-extended too.
fn int_extend(ty: &TypeDescriptor) -> Extend {
    match ty.kind() {
        PrimitiveKind::UInt32 | PrimitiveKind::UInt32S => Extend::Sign,
        _ => scalar_extend(ty),
    }
}

fn float_extend(size: u32) -> Extend {
    if size == 4 { Extend::NanBox } else { Extend::None }
}

fn field_piece(field: &Field, dest: Location) -> Piece {
    let extend = match (dest, field.float) {
        (Location::Vec(_), true) => float_extend(field.size),
        (_, true) => Extend::None,
        _ if field.signed || field.size == 4 => Extend::Sign,
        _ => Extend::Zero,
    };
    Piece::widened(field.offset, field.size, dest, extend, 8)
}

impl State {
    fn push_stack(&mut self, size: u32, align: u32, extend: Extend) -> Piece {
        self.stack = self.stack.next_multiple_of(align.max(8));
        let piece = stack_piece(size, self.stack, 8, extend);
        self.stack += piece.width;
        piece
    }

    /// Integer convention: up to two XLEN registers, split between a7
    /// and the stack when only one register is left.
    fn place_integer(&mut self, layout: &mut ParamLayout, size: u32, align: u32, extend: Extend) {
        if align >= 16 {
            self.gpr = self.gpr.next_multiple_of(2);
        }
        let regs = size.div_ceil(8) as u8;
        if self.gpr + regs <= ARG_REGS {
            layout.pieces = if regs == 1 {
                vec![Piece::widened(0, size, Location::Gpr(self.gpr), extend, 8)]
            } else {
                register_run(0, size, 8, self.gpr, Location::Gpr)
            };
            layout.gpr_count = regs;
            self.gpr += regs;
        } else if regs == 2 && self.gpr == ARG_REGS - 1 {
            layout.pieces = vec![
                Piece::raw(0, 8, Location::Gpr(self.gpr)),
                Piece::widened(8, size - 8, Location::Stack(self.stack), Extend::None, 8),
            ];
            layout.gpr_count = 1;
            layout.stack_bytes = 8;
            self.gpr = ARG_REGS;
            self.stack += 8;
        } else {
            self.gpr = ARG_REGS;
            let piece = self.push_stack(size, align, extend);
            layout.stack_bytes = piece.width;
            layout.pieces.push(piece);
        }
    }

    /// Floating-point convention for a flattened aggregate, when enough
    /// registers of each bank remain.
    fn place_flat(&mut self, layout: &mut ParamLayout, fields: &[Field]) -> bool {
        let floats = fields.iter().filter(|f| f.float).count() as u8;
        let ints = fields.len() as u8 - floats;
        if self.fpr + floats > ARG_REGS || self.gpr + ints > ARG_REGS {
            return false;
        }
        for (i, field) in fields.iter().enumerate() {
            let dest = if field.float {
                self.fpr += 1;
                Location::Vec(self.fpr - 1)
            } else {
                self.gpr += 1;
                Location::Gpr(self.gpr - 1)
            };
            layout.pieces.push(field_piece(field, dest));
            layout.sizes[i] = field.size as u8;
        }
        layout.vec_count = floats;
        layout.gpr_count = ints;
        layout.gpr_first = !fields[0].float;
        true
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
    if let Some(fields) = flatten(ret) {
        let (mut gpr, mut fpr) = (0u8, 0u8);
        return direct(
            fields
                .iter()
                .map(|field| {
                    let dest = if field.float {
                        fpr += 1;
                        Location::Vec(fpr - 1)
                    } else {
                        gpr += 1;
                        Location::Gpr(gpr - 1)
                    };
                    Piece::raw(field.offset, field.size, dest)
                })
                .collect(),
        );
    }
    if size > 16 {
        return ReturnLayout {
            mode: PassMode::Indirect,
            hidden: Some(Location::Gpr(0)),
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

impl Classifier for RiscV64 {
    fn abi(&self) -> Abi {
        Abi::RiscV64
    }

    fn shape(&self) -> FrameShape {
        FrameShape {
            gpr_count: ARG_REGS,
            gpr_slot: 8,
            vec_count: ARG_REGS,
            vec_slot: 8,
            stack_slot: 8,
            shadow: 0,
        }
    }

    fn classify(&self, sig: &FunctionSignature) -> AlienResult<FunctionLayout> {
        let ret = return_layout(&sig.ret);
        let mut st = State {
            gpr: u8::from(ret.mode == PassMode::Indirect),
            fpr: 0,
            stack: 0,
        };

        let mut params = Vec::with_capacity(sig.params.len());
        for param in &sig.params {
            let ty = &param.ty;
            let kind = ty.kind();
            let size = ty.size() as u32;
            let align = ty.align() as u32;
            let mut layout = ParamLayout::default();

            if size == 0 {
                params.push(ParamLayout::ignored());
                continue;
            }
            if kind.is_float() {
                if !param.variadic && st.fpr < ARG_REGS {
                    layout.pieces.push(Piece::widened(
                        0,
                        size,
                        Location::Vec(st.fpr),
                        float_extend(size),
                        8,
                    ));
                    layout.vec_count = 1;
                    st.fpr += 1;
                } else {
                    let extend = if param.variadic && kind == PrimitiveKind::Float32 {
                        Extend::Promote
                    } else {
                        Extend::None
                    };
                    st.place_integer(&mut layout, size, align, extend);
                }
            } else if !kind.is_aggregate() {
                st.place_integer(&mut layout, size, align, int_extend(ty));
            } else if size > 16 {
                layout.mode = PassMode::Indirect;
                layout.use_memory = true;
                st.place_integer(&mut layout, 8, 8, Extend::None);
            } else {
                let flat = if param.variadic { None } else { flatten(ty) };
                let placed = flat.is_some_and(|fields| st.place_flat(&mut layout, &fields));
                if !placed {
                    st.place_integer(&mut layout, size, align, Extend::None);
                }
            }
            params.push(layout);
        }

        Ok(finish(Abi::RiscV64, params, ret, st.stack))
    }

    fn register_name(&self, loc: Location) -> String {
        match loc {
            Location::Gpr(i) => format!("a{i}"),
            Location::Vec(i) => format!("fa{i}"),
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
    fn unsigned_words_are_sign_extended_and_singles_nan_boxed() {
        let mut r = reg(Abi::RiscV64);
        let u32_ = prim(&mut r, PrimitiveKind::UInt32);
        let u16_ = prim(&mut r, PrimitiveKind::UInt16);
        let f32_ = prim(&mut r, PrimitiveKind::Float32);
        let void = prim(&mut r, PrimitiveKind::Void);
        let sig = FunctionSignature::new("f", void).param(u32_).param(u16_).param(f32_);
        let layout = classify(Abi::RiscV64, &sig).expect("classify");
        assert_eq!(layout.params[0].pieces[0].extend, Extend::Sign);
        assert_eq!(layout.params[1].pieces[0].extend, Extend::Zero);
        let single = layout.params[2].pieces[0];
        assert_eq!(single.dest, Location::Vec(0));
        assert_eq!((single.extend, single.width), (Extend::NanBox, 8));
    }

    #[test]
    fn float_int_records_use_one_register_of_each_bank() {
        let mut r = reg(Abi::RiscV64);
        let mixed = record(&mut r, &[PrimitiveKind::Float32, PrimitiveKind::Int32]);
        let ret = record(&mut r, &[PrimitiveKind::Int32, PrimitiveKind::Float64]);
        let sig = FunctionSignature::new("f", ret).param(mixed);
        let layout = classify(Abi::RiscV64, &sig).expect("classify");
        let p = &layout.params[0];
        assert_eq!(p.pieces[0].dest, Location::Vec(0));
        assert_eq!(p.pieces[1], Piece::widened(4, 4, Location::Gpr(0), Extend::Sign, 8));
        assert!(!p.gpr_first);
        assert_eq!(layout.forward, ForwardKind::GprVec);
        assert_eq!(layout.ret.pieces[1].src, 8);
    }

    #[test]
    fn floats_fall_back_to_integer_registers() {
        let mut r = reg(Abi::RiscV64);
        let f64_ = prim(&mut r, PrimitiveKind::Float64);
        let void = prim(&mut r, PrimitiveKind::Void);
        let mut sig = FunctionSignature::new("f", void);
        for _ in 0..9 {
            sig = sig.param(f64_.clone());
        }
        let layout = classify(Abi::RiscV64, &sig).expect("classify");
        assert_eq!(layout.params[7].pieces[0].dest, Location::Vec(7));
        assert_eq!(layout.params[8].pieces[0].dest, Location::Gpr(0));
    }

    #[test]
    fn variadic_doubles_use_integer_registers() {
        let mut r = reg(Abi::RiscV64);
        let ptr = prim(&mut r, PrimitiveKind::Pointer);
        let f64_ = prim(&mut r, PrimitiveKind::Float64);
        let int = prim(&mut r, PrimitiveKind::Int32);
        let sig = FunctionSignature::new("printf", int)
            .param(ptr)
            .variadic()
            .with_variadic(&[f64_]);
        let layout = classify(Abi::RiscV64, &sig).expect("classify");
        assert_eq!(layout.params[1].pieces[0].dest, Location::Gpr(1));
        assert!(!layout.forward_fp);
    }

    #[test]
    fn two_word_records_split_between_a7_and_the_stack() {
        let mut r = reg(Abi::RiscV64);
        let i64_ = prim(&mut r, PrimitiveKind::Int64);
        let pair = record(&mut r, &[PrimitiveKind::Int64; 2]);
        let void = prim(&mut r, PrimitiveKind::Void);
        let mut sig = FunctionSignature::new("f", void);
        for _ in 0..7 {
            sig = sig.param(i64_.clone());
        }
        sig = sig.param(pair).param(i64_);
        let layout = classify(Abi::RiscV64, &sig).expect("classify");
        let dests: Vec<_> = layout.params[7].pieces.iter().map(|p| p.dest).collect();
        assert_eq!(dests, vec![Location::Gpr(7), Location::Stack(0)]);
        assert_eq!(layout.params[8].pieces[0].dest, Location::Stack(8));
    }

    #[test]
    fn large_aggregates_are_passed_by_reference() {
        let mut r = reg(Abi::RiscV64);
        let big = record(&mut r, &[PrimitiveKind::Int64; 3]);
        let sig = FunctionSignature::new("f", big.clone()).param(big);
        let layout = classify(Abi::RiscV64, &sig).expect("classify");
        assert_eq!(layout.ret.hidden, Some(Location::Gpr(0)));
        assert_eq!(layout.params[0].mode, PassMode::Indirect);
        assert_eq!(layout.params[0].pieces[0].dest, Location::Gpr(1));
    }
}
