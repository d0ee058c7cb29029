use ctype::{
    Abi, Extend, FunctionLayout, FunctionSignature, Location, ParamLayout, PassMode, Piece,
    PrimitiveKind, ReturnLayout, TypeDescriptor,
};

use super::{
    Classifier, FrameShape,
    classes::{Hfa, hfa},
    finish, register_run, scalar_extend, stack_piece,
};
use crate::AlienResult;

/// AAPCS. With `vfp` set, floats and homogeneous float aggregates of
/// non-variadic calls travel in s0-s15 / d0-d7.
pub struct Arm32 {
    pub vfp: bool,
}

const CORE_REGS: u8 = 4;
const VFP_SINGLES: u32 = 16;

struct State {
    ncrn: u8,
    nsaa: u32,
    /// One bit per used single-precision register.
    vfp_used: u32,
}

impl State {
    /// Finds `span` free singles starting at a multiple of `step`; the
    /// lowest fit wins so earlier holes get back-filled.
    fn take_vfp(&mut self, span: u32, step: u32) -> Option<u8> {
        let mask = (1u32 << span) - 1;
        let start = (0..=VFP_SINGLES.saturating_sub(span))
            .step_by(step as usize)
            .find(|&i| self.vfp_used & (mask << i) == 0)?;
        self.vfp_used |= mask << start;
        Some(start as u8)
    }

    fn close_vfp(&mut self) {
        self.vfp_used = (1 << VFP_SINGLES) - 1;
    }

    fn push_stack(&mut self, size: u32, align: u32, extend: Extend) -> Piece {
        self.nsaa = self.nsaa.next_multiple_of(align.clamp(4, 8));
        let piece = stack_piece(size, self.nsaa, 4, extend);
        self.nsaa += piece.width;
        piece
    }

    /// Core register rules: even pairs for 8-aligned values, splitting
    /// between r3 and the stack while nothing is on the stack yet.
    fn place_core(&mut self, layout: &mut ParamLayout, size: u32, align: u32, extend: Extend) {
        if align >= 8 {
            self.ncrn = self.ncrn.next_multiple_of(2);
        }
        let regs = size.div_ceil(4) as u8;
        if self.ncrn + regs <= CORE_REGS {
            if size <= 4 {
                layout
                    .pieces
                    .push(Piece::widened(0, size, Location::Gpr(self.ncrn), extend, 4));
            } else {
                layout.pieces = register_run(0, size, 4, self.ncrn, Location::Gpr);
            }
            layout.gpr_count = regs;
            self.ncrn += regs;
        } else if self.ncrn < CORE_REGS && self.nsaa == 0 {
            let in_regs = u32::from(CORE_REGS - self.ncrn) * 4;
            layout.pieces = register_run(0, in_regs, 4, self.ncrn, Location::Gpr);
            let rest = size - in_regs;
            layout
                .pieces
                .push(Piece::widened(in_regs, rest, Location::Stack(0), Extend::None, rest.next_multiple_of(4)));
            layout.gpr_count = CORE_REGS - self.ncrn;
            layout.stack_bytes = rest.next_multiple_of(4);
            self.nsaa = layout.stack_bytes;
            self.ncrn = CORE_REGS;
        } else {
            self.ncrn = CORE_REGS;
            let piece = self.push_stack(size, align, extend);
            layout.stack_bytes = piece.width;
            layout.pieces.push(piece);
        }
    }

    /// A variadic f32 becomes a double: an even register pair or an
    /// 8-byte aligned stack slot.
    fn place_promoted(&mut self, layout: &mut ParamLayout) {
        self.ncrn = self.ncrn.next_multiple_of(2);
        if self.ncrn + 2 <= CORE_REGS {
            layout
                .pieces
                .push(Piece::widened(0, 4, Location::Gpr(self.ncrn), Extend::Promote, 8));
            layout.gpr_count = 2;
            self.ncrn += 2;
        } else {
            self.ncrn = CORE_REGS;
            self.nsaa = self.nsaa.next_multiple_of(8);
            layout
                .pieces
                .push(Piece::widened(0, 4, Location::Stack(self.nsaa), Extend::Promote, 8));
            layout.stack_bytes = 8;
            self.nsaa += 8;
        }
    }

    fn place_vfp(&mut self, layout: &mut ParamLayout, fa: Hfa) -> bool {
        let singles = fa.element_size() / 4;
        let Some(base) = self.take_vfp(singles * fa.count, singles) else {
            return false;
        };
        layout.pieces = (0..fa.count)
            .map(|i| {
                let esize = fa.element_size();
                Piece::raw(i * esize, esize, Location::Vec(base + (i * singles) as u8))
            })
            .collect();
        layout.vec_count = fa.count as u8;
        true
    }
}

/// Float scalars count as one-element homogeneous aggregates.
fn vfp_candidate(ty: &TypeDescriptor) -> Option<Hfa> {
    let kind = ty.kind();
    if kind.is_float() {
        Some(Hfa { kind, count: 1 })
    } else {
        hfa(ty)
    }
}

impl Arm32 {
    fn abi_tag(&self) -> Abi {
        if self.vfp { Abi::Arm32Vfp } else { Abi::Arm32 }
    }

    fn return_layout(&self, ret: &TypeDescriptor, hard: bool) -> ReturnLayout {
        let kind = ret.kind();
        let size = ret.size() as u32;
        if kind == PrimitiveKind::Void || size == 0 {
            return ReturnLayout {
                mode: PassMode::Ignore,
                ..ReturnLayout::default()
            };
        }
        if hard && let Some(fa) = vfp_candidate(ret) {
            let singles = fa.element_size() / 4;
            let pieces = (0..fa.count)
                .map(|i| {
                    let esize = fa.element_size();
                    Piece::raw(i * esize, esize, Location::Vec((i * singles) as u8))
                })
                .collect();
            return ReturnLayout {
                mode: PassMode::Direct,
                hidden: None,
                pieces,
            };
        }
        if kind.is_aggregate() && size > 4 {
            return ReturnLayout {
                mode: PassMode::Indirect,
                hidden: Some(Location::Gpr(0)),
                pieces: Vec::new(),
            };
        }
        let pieces = if size > 4 {
            vec![
                Piece::raw(0, 4, Location::Gpr(0)),
                Piece::raw(4, size - 4, Location::Gpr(1)),
            ]
        } else {
            vec![Piece::raw(0, size, Location::Gpr(0))]
        };
        ReturnLayout {
            mode: PassMode::Direct,
            hidden: None,
            pieces,
        }
    }
}

impl Classifier for Arm32 {
    fn abi(&self) -> Abi {
        self.abi_tag()
    }

    fn shape(&self) -> FrameShape {
        FrameShape {
            gpr_count: CORE_REGS,
            gpr_slot: 4,
            vec_count: if self.vfp { VFP_SINGLES as u8 } else { 0 },
            vec_slot: 4,
            stack_slot: 4,
            shadow: 0,
        }
    }

    fn classify(&self, sig: &FunctionSignature) -> AlienResult<FunctionLayout> {
        // variadic calls fall back to the base standard
        let hard = self.vfp && !sig.variadic;
        let ret = self.return_layout(&sig.ret, hard);
        let mut st = State {
            ncrn: u8::from(ret.mode == PassMode::Indirect),
            nsaa: 0,
            vfp_used: 0,
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
            if hard && let Some(fa) = vfp_candidate(ty) {
                if !st.place_vfp(&mut layout, fa) {
                    st.close_vfp();
                    let piece = st.push_stack(size, fa.element_size(), Extend::None);
                    layout.stack_bytes = piece.width;
                    layout.pieces.push(piece);
                }
            } else if param.variadic && kind == PrimitiveKind::Float32 {
                st.place_promoted(&mut layout);
            } else {
                let extend = if kind.is_aggregate() {
                    Extend::None
                } else {
                    scalar_extend(ty)
                };
                st.place_core(&mut layout, size, align, extend);
            }
            params.push(layout);
        }

        Ok(finish(self.abi_tag(), params, ret, st.nsaa))
    }

    fn register_name(&self, loc: Location) -> String {
        match loc {
            Location::Gpr(i) => format!("r{i}"),
            Location::Vec(i) => format!("s{i}"),
            Location::Stack(off) => format!("[sp+{off}]"),
        }
    }
}
