use ctype::{
    Abi, Extend, FunctionLayout, FunctionSignature, Location, ParamLayout, PassMode, Piece,
    PrimitiveKind, ReturnLayout, TypeDescriptor,
};

use super::{Classifier, FrameShape, finish, scalar_extend};
use crate::AlienResult;

const GPR_NAMES: [&str; 4] = ["rcx", "rdx", "r8", "r9"];
const SHADOW: u32 = 32;

pub struct Win64;

/// Aggregates travel by value only when they fit a register exactly.
fn by_value(ty: &TypeDescriptor) -> bool {
    !ty.kind().is_aggregate() || matches!(ty.size(), 1 | 2 | 4 | 8)
}

fn slot_location(slot: u32, float: bool) -> Location {
    if slot < 4 {
        if float {
            Location::Vec(slot as u8)
        } else {
            Location::Gpr(slot as u8)
        }
    } else {
        Location::Stack(SHADOW + 8 * (slot - 4))
    }
}

fn return_layout(ret: &TypeDescriptor) -> ReturnLayout {
    let kind = ret.kind();
    if kind == PrimitiveKind::Void || ret.size() == 0 {
        return ReturnLayout {
            mode: PassMode::Ignore,
            ..ReturnLayout::default()
        };
    }
    if !by_value(ret) {
        return ReturnLayout {
            mode: PassMode::Indirect,
            hidden: Some(Location::Gpr(0)),
            pieces: Vec::new(),
        };
    }
    let dest = if kind.is_float() {
        Location::Vec(0)
    } else {
        Location::Gpr(0)
    };
    ReturnLayout {
        mode: PassMode::Direct,
        hidden: None,
        pieces: vec![Piece::raw(0, ret.size() as u32, dest)],
    }
}

impl Classifier for Win64 {
    fn abi(&self) -> Abi {
        Abi::X64Windows
    }

    fn shape(&self) -> FrameShape {
        FrameShape {
            gpr_count: 4,
            gpr_slot: 8,
            vec_count: 4,
            vec_slot: 8,
            stack_slot: 8,
            shadow: SHADOW,
        }
    }

    fn classify(&self, sig: &FunctionSignature) -> AlienResult<FunctionLayout> {
        let ret = return_layout(&sig.ret);
        let mut slot = u32::from(ret.mode == PassMode::Indirect);

        let mut params = Vec::with_capacity(sig.params.len());
        for param in &sig.params {
            let ty = &param.ty;
            let kind = ty.kind();
            let mut layout = ParamLayout::default();
            let float = kind.is_float();
            let size = if by_value(ty) { ty.size() as u32 } else { 8 };
            let extend = if float && param.variadic && kind == PrimitiveKind::Float32 {
                Extend::Promote
            } else if float || kind.is_aggregate() {
                Extend::None
            } else {
                scalar_extend(ty)
            };

            if !by_value(ty) {
                layout.mode = PassMode::Indirect;
                layout.use_memory = true;
            }
            let dest = slot_location(slot, float);
            layout.pieces.push(Piece::widened(0, size, dest, extend, 8));
            match dest {
                Location::Vec(i) => {
                    layout.vec_count = 1;
                    // variadic callees read floats from the integer slot
                    if param.variadic {
                        layout.pieces.push(Piece::widened(0, size, Location::Gpr(i), extend, 8));
                        layout.gpr_count = 1;
                    }
                }
                Location::Gpr(_) => layout.gpr_count = 1,
                Location::Stack(_) => layout.stack_bytes = 8,
            }
            slot += 1;
            params.push(layout);
        }

        let stack = SHADOW + 8 * slot.saturating_sub(4);
        Ok(finish(Abi::X64Windows, params, ret, stack))
    }

    fn register_name(&self, loc: Location) -> String {
        match loc {
            Location::Gpr(i) => GPR_NAMES.get(i as usize).map_or("?", |n| n).to_string(),
            Location::Vec(i) => format!("xmm{i}"),
            Location::Stack(off) => format!("[rsp+{off}]"),
        }
    }

    fn return_register_name(&self, loc: Location) -> String {
        match loc {
            Location::Gpr(_) => "rax".to_string(),
            other => self.register_name(other),
        }
    }
}
