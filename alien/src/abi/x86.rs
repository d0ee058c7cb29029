use ctype::{
    Abi, CallConv, Extend, FunctionLayout, FunctionSignature, Location, ParamLayout, PassMode,
    Piece, PrimitiveKind, ReturnLayout, TypeDescriptor,
};

use super::{Classifier, FrameShape, finish, scalar_extend, stack_piece};
use crate::{AlienError, AlienResult};

const GPR_NAMES: [&str; 2] = ["ecx", "edx"];
const RET_GPR_NAMES: [&str; 2] = ["eax", "edx"];

/// i386 cdecl, stdcall, fastcall and thiscall. Windows returns small
/// aggregates in eax:edx; System V always returns them in memory.
pub struct X86 {
    pub windows: bool,
}

/// Leading parameters that fastcall and thiscall may put in ecx/edx.
fn register_eligible(ty: &TypeDescriptor) -> bool {
    let kind = ty.kind();
    !kind.is_aggregate() && !kind.is_float() && ty.size() <= 4
}

impl X86 {
    fn abi_tag(&self) -> Abi {
        if self.windows {
            Abi::X86Windows
        } else {
            Abi::X86SysV
        }
    }

    fn return_layout(&self, ret: &TypeDescriptor) -> ReturnLayout {
        let kind = ret.kind();
        let size = ret.size() as u32;
        let direct = |pieces| ReturnLayout {
            mode: PassMode::Direct,
            hidden: None,
            pieces,
        };
        if kind == PrimitiveKind::Void || size == 0 {
            return ReturnLayout {
                mode: PassMode::Ignore,
                ..ReturnLayout::default()
            };
        }
        if kind.is_float() {
            return direct(vec![Piece::widened(0, size, Location::Vec(0), Extend::X87, 8)]);
        }
        let in_registers = !kind.is_aggregate() || (self.windows && matches!(size, 1 | 2 | 4 | 8));
        if !in_registers {
            return ReturnLayout {
                mode: PassMode::Indirect,
                hidden: Some(Location::Stack(0)),
                pieces: Vec::new(),
            };
        }
        if size > 4 {
            direct(vec![
                Piece::raw(0, 4, Location::Gpr(0)),
                Piece::raw(4, size - 4, Location::Gpr(1)),
            ])
        } else {
            direct(vec![Piece::raw(0, size, Location::Gpr(0))])
        }
    }
}

impl Classifier for X86 {
    fn abi(&self) -> Abi {
        self.abi_tag()
    }

    fn shape(&self) -> FrameShape {
        FrameShape {
            gpr_count: 2,
            gpr_slot: 4,
            vec_count: 0,
            vec_slot: 8,
            stack_slot: 4,
            shadow: 0,
        }
    }

    fn classify(&self, sig: &FunctionSignature) -> AlienResult<FunctionLayout> {
        let abi = self.abi_tag();
        if sig.variadic && sig.conv != CallConv::Cdecl {
            return Err(AlienError::classification(
                &sig.name,
                abi,
                format!("variadic functions must be cdecl, not {}", sig.conv),
            ));
        }

        let ret = self.return_layout(&sig.ret);
        let reg_budget: u8 = match sig.conv {
            CallConv::Fastcall => 2,
            CallConv::Thiscall => 1,
            _ => 0,
        };
        let mut gpr = 0u8;
        let mut stack = if ret.mode == PassMode::Indirect { 4 } else { 0 };
        // bytes of declared parameters, for stdcall/fastcall decoration
        let mut declared = 0u32;

        let mut params = Vec::with_capacity(sig.params.len());
        for (i, param) in sig.params.iter().enumerate() {
            let ty = &param.ty;
            let kind = ty.kind();
            let size = ty.size() as u32;
            let mut layout = ParamLayout::default();
            declared += size.next_multiple_of(4);

            let eligible = register_eligible(ty)
                && gpr < reg_budget
                && (sig.conv != CallConv::Thiscall || i == 0);
            if eligible {
                layout.pieces.push(Piece::widened(0, size, Location::Gpr(gpr), scalar_extend(ty), 4));
                layout.gpr_count = 1;
                gpr += 1;
            } else if size == 0 {
                layout = ParamLayout::ignored();
            } else {
                let (len, extend) = if param.variadic && kind == PrimitiveKind::Float32 {
                    (4, Extend::Promote)
                } else {
                    (size, if kind.is_aggregate() { Extend::None } else { scalar_extend(ty) })
                };
                let mut piece = stack_piece(len, stack, 4, extend);
                if extend == Extend::Promote {
                    piece.width = 8;
                }
                stack += piece.width;
                layout.stack_bytes = piece.width;
                layout.use_memory = kind.is_aggregate();
                layout.pieces.push(piece);
            }
            params.push(layout);
        }

        let callee_pops = match sig.conv {
            CallConv::Cdecl if ret.mode == PassMode::Indirect && !self.windows => 4,
            CallConv::Cdecl => 0,
            _ => stack,
        };
        let decorated_name = self.windows.then(|| match sig.conv {
            CallConv::Cdecl => format!("_{}", sig.name),
            CallConv::Stdcall => format!("_{}@{declared}", sig.name),
            CallConv::Fastcall => format!("@{}@{declared}", sig.name),
            CallConv::Thiscall => sig.name.clone(),
        });

        let mut layout = finish(abi, params, ret, stack);
        layout.callee_pops = callee_pops;
        layout.decorated_name = decorated_name;
        Ok(layout)
    }

    fn check_callback(&self, sig: &FunctionSignature) -> AlienResult<()> {
        match sig.conv {
            CallConv::Cdecl | CallConv::Stdcall => Ok(()),
            other => Err(AlienError::classification(
                &sig.name,
                self.abi_tag(),
                format!("{other} callbacks are not supported"),
            )),
        }
    }

    fn register_name(&self, loc: Location) -> String {
        match loc {
            Location::Gpr(i) => GPR_NAMES.get(i as usize).map_or("?", |n| n).to_string(),
            Location::Vec(_) => "st(0)".to_string(),
            Location::Stack(off) => format!("[esp+{off}]"),
        }
    }

    fn return_register_name(&self, loc: Location) -> String {
        match loc {
            Location::Gpr(i) => RET_GPR_NAMES.get(i as usize).map_or("?", |n| n).to_string(),
            other => self.register_name(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{
        classify, classify_callback,
        tests::{prim, record, reg},
    };
    use ctype::ForwardKind;

    #[test]
    fn fastcall_uses_ecx_edx_for_small_integers() {
        let mut r = reg(Abi::X86Windows);
        let i32_ = prim(&mut r, PrimitiveKind::Int32);
        let i64_ = prim(&mut r, PrimitiveKind::Int64);
        let void = prim(&mut r, PrimitiveKind::Void);
        let sig = FunctionSignature::new("f", void)
            .conv(CallConv::Fastcall)
            .param(i64_)
            .param(i32_.clone())
            .param(i32_.clone())
            .param(i32_);
        let layout = classify(Abi::X86Windows, &sig).expect("classify");
        let dests: Vec<_> = layout.params.iter().map(|p| p.pieces[0].dest).collect();
        assert_eq!(
            dests,
            vec![
                Location::Stack(0),
                Location::Gpr(0),
                Location::Gpr(1),
                Location::Stack(8)
            ]
        );
        assert_eq!(layout.callee_pops, 12);
        assert_eq!(layout.decorated_name.as_deref(), Some("@f@20"));
    }

    #[test]
    fn thiscall_only_passes_the_first_parameter_in_ecx() {
        let mut r = reg(Abi::X86Windows);
        let ptr = prim(&mut r, PrimitiveKind::Pointer);
        let i32_ = prim(&mut r, PrimitiveKind::Int32);
        let sig = FunctionSignature::new("m", i32_.clone())
            .conv(CallConv::Thiscall)
            .param(ptr)
            .param(i32_);
        let layout = classify(Abi::X86Windows, &sig).expect("classify");
        assert_eq!(layout.params[0].pieces[0].dest, Location::Gpr(0));
        assert_eq!(layout.params[1].pieces[0].dest, Location::Stack(0));
    }

    #[test]
    fn stdcall_decoration_counts_argument_bytes() {
        let mut r = reg(Abi::X86Windows);
        let i16_ = prim(&mut r, PrimitiveKind::Int16);
        let f64_ = prim(&mut r, PrimitiveKind::Float64);
        let sig = FunctionSignature::new("Beep", f64_.clone())
            .conv(CallConv::Stdcall)
            .param(i16_)
            .param(f64_);
        let layout = classify(Abi::X86Windows, &sig).expect("classify");
        assert_eq!(layout.decorated_name.as_deref(), Some("_Beep@12"));
        assert_eq!(layout.forward, ForwardKind::X87);
        assert_eq!(layout.params[1].pieces[0].dest, Location::Stack(4));
    }

    #[test]
    fn small_records_return_in_registers_on_windows_only() {
        for (abi, expect_hidden) in [(Abi::X86Windows, false), (Abi::X86SysV, true)] {
            let mut r = reg(abi);
            let pair = record(&mut r, &[PrimitiveKind::Int32, PrimitiveKind::Int32]);
            let sig = FunctionSignature::new("f", pair);
            let layout = classify(abi, &sig).expect("classify");
            assert_eq!(layout.ret.hidden.is_some(), expect_hidden, "{abi}");
        }
        let mut r = reg(Abi::X86SysV);
        let pair = record(&mut r, &[PrimitiveKind::Int32, PrimitiveKind::Int32]);
        let layout = classify(Abi::X86SysV, &FunctionSignature::new("f", pair)).expect("classify");
        assert_eq!(layout.ret.hidden, Some(Location::Stack(0)));
        assert_eq!(layout.callee_pops, 4);
        assert_eq!(layout.decorated_name, None);
    }

    #[test]
    fn fastcall_callbacks_are_rejected() {
        let mut r = reg(Abi::X86Windows);
        let void = prim(&mut r, PrimitiveKind::Void);
        let sig = FunctionSignature::new("cb", void).conv(CallConv::Fastcall);
        assert!(classify_callback(Abi::X86Windows, &sig).is_err());
        assert!(classify_callback(Abi::X86Windows, &sig.clone().conv(CallConv::Stdcall)).is_ok());
    }

    #[test]
    fn stack_doubles_are_four_byte_aligned() {
        let mut r = reg(Abi::X86SysV);
        let i32_ = prim(&mut r, PrimitiveKind::Int32);
        let f64_ = prim(&mut r, PrimitiveKind::Float64);
        let sig = FunctionSignature::new("f", i32_.clone()).param(i32_).param(f64_);
        let layout = classify(Abi::X86SysV, &sig).expect("classify");
        assert_eq!(layout.params[1].pieces[0].dest, Location::Stack(4));
        assert_eq!(layout.args_size, 16);
    }
}
