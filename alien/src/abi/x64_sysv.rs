use ctype::{
    Abi, Extend, FunctionLayout, FunctionSignature, Location, ParamLayout, PassMode, Piece,
    PrimitiveKind, ReturnLayout, TypeDescriptor,
};

use super::{
    Classifier, FrameShape,
    classes::{ArgClass, eightbytes},
    finish, scalar_extend, stack_piece,
};
use crate::AlienResult;

const GPR_NAMES: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];
const RET_GPR_NAMES: [&str; 2] = ["rax", "rdx"];

pub struct SysV;

struct State {
    gpr: u8,
    vec: u8,
    stack: u32,
}

impl State {
    fn push_stack(&mut self, ty: &TypeDescriptor, extend: Extend) -> Piece {
        let align = (ty.align() as u32).max(8);
        self.stack = self.stack.next_multiple_of(align);
        let piece = stack_piece(ty.size() as u32, self.stack, 8, extend);
        self.stack += piece.width;
        piece
    }
}

fn return_layout(ret: &TypeDescriptor) -> ReturnLayout {
    if ret.kind() == PrimitiveKind::Void || ret.size() == 0 {
        return ReturnLayout {
            mode: PassMode::Ignore,
            ..ReturnLayout::default()
        };
    }
    let classes = if ret.kind().is_aggregate() {
        eightbytes(ret)
    } else if ret.kind().is_float() {
        vec![ArgClass::Sse]
    } else {
        vec![ArgClass::Integer]
    };
    if classes == [ArgClass::Memory] {
        return ReturnLayout {
            mode: PassMode::Indirect,
            hidden: Some(Location::Gpr(0)),
            pieces: Vec::new(),
        };
    }
    let size = ret.size() as u32;
    let (mut gpr, mut vec) = (0u8, 0u8);
    let pieces = classes
        .iter()
        .enumerate()
        .map(|(i, class)| {
            let src = 8 * i as u32;
            let len = (size - src).min(8);
            let dest = if *class == ArgClass::Sse {
                vec += 1;
                Location::Vec(vec - 1)
            } else {
                gpr += 1;
                Location::Gpr(gpr - 1)
            };
            Piece::raw(src, len, dest)
        })
        .collect();
    ReturnLayout {
        mode: PassMode::Direct,
        hidden: None,
        pieces,
    }
}

impl Classifier for SysV {
    fn abi(&self) -> Abi {
        Abi::X64SysV
    }

    fn shape(&self) -> FrameShape {
        FrameShape {
            gpr_count: 6,
            gpr_slot: 8,
            vec_count: 8,
            vec_slot: 8,
            stack_slot: 8,
            shadow: 0,
        }
    }

    fn classify(&self, sig: &FunctionSignature) -> AlienResult<FunctionLayout> {
        let ret = return_layout(&sig.ret);
        let mut st = State {
            gpr: u8::from(ret.mode == PassMode::Indirect),
            vec: 0,
            stack: 0,
        };

        let mut params = Vec::with_capacity(sig.params.len());
        for param in &sig.params {
            let ty = &param.ty;
            let kind = ty.kind();
            let mut layout = ParamLayout::default();

            if kind.is_float() {
                let extend = if param.variadic && kind == PrimitiveKind::Float32 {
                    Extend::Promote
                } else {
                    Extend::None
                };
                if st.vec < 8 {
                    layout.pieces.push(Piece::widened(0, ty.size() as u32, Location::Vec(st.vec), extend, 8));
                    layout.vec_count = 1;
                    st.vec += 1;
                } else {
                    layout.pieces.push(st.push_stack(ty, extend));
                    layout.stack_bytes = 8;
                }
            } else if !kind.is_aggregate() {
                let extend = scalar_extend(ty);
                if st.gpr < 6 {
                    layout.pieces.push(Piece::widened(0, ty.size() as u32, Location::Gpr(st.gpr), extend, 8));
                    layout.gpr_count = 1;
                    st.gpr += 1;
                } else {
                    layout.pieces.push(st.push_stack(ty, extend));
                    layout.stack_bytes = 8;
                }
            } else if ty.size() == 0 {
                layout = ParamLayout::ignored();
            } else {
                let classes = eightbytes(ty);
                let need_gpr = classes.iter().filter(|c| **c == ArgClass::Integer).count() as u8;
                let need_vec = classes.iter().filter(|c| **c == ArgClass::Sse).count() as u8;
                let memory = classes == [ArgClass::Memory];
                let size = ty.size() as u32;

                if !memory && st.gpr + need_gpr <= 6 && st.vec + need_vec <= 8 {
                    for (i, class) in classes.iter().enumerate() {
                        let src = 8 * i as u32;
                        let len = (size - src).min(8);
                        let dest = if *class == ArgClass::Sse {
                            st.vec += 1;
                            Location::Vec(st.vec - 1)
                        } else {
                            st.gpr += 1;
                            Location::Gpr(st.gpr - 1)
                        };
                        layout.pieces.push(Piece::widened(src, len, dest, Extend::None, 8));
                        layout.sizes[i] = len as u8;
                    }
                    layout.gpr_count = need_gpr;
                    layout.vec_count = need_vec;
                    layout.gpr_first = classes[0] == ArgClass::Integer;
                } else {
                    // MEMORY class and register overflow both copy the whole
                    // aggregate onto the stack
                    let piece = st.push_stack(ty, Extend::None);
                    layout.stack_bytes = piece.width;
                    layout.pieces.push(piece);
                    layout.use_memory = memory;
                }
            }
            params.push(layout);
        }

        Ok(finish(Abi::X64SysV, params, ret, st.stack))
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
            Location::Gpr(i) => RET_GPR_NAMES.get(i as usize).map_or("?", |n| n).to_string(),
            other => self.register_name(other),
        }
    }
}
