use crate::DataModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Void,
    Bool,
    Int8,
    UInt8,
    Int16,
    Int16S,
    UInt16,
    UInt16S,
    Int32,
    Int32S,
    UInt32,
    UInt32S,
    Int64,
    Int64S,
    UInt64,
    UInt64S,
    Float32,
    Float64,
    /// NUL-terminated narrow string (`char *`).
    String,
    /// NUL-terminated UTF-16 string (`char16_t *`).
    String16,
    /// NUL-terminated UTF-32 string (`char32_t *`).
    String32,
    Pointer,
    /// Pointer to a function with a known prototype.
    Callback,
    Record,
    Union,
    Array,
    /// The function type itself; only reachable behind a callback.
    Prototype,
}

const KEYWORDS: &[(&str, PrimitiveKind)] = &[
    ("void", PrimitiveKind::Void),
    ("bool", PrimitiveKind::Bool),
    ("i8", PrimitiveKind::Int8),
    ("u8", PrimitiveKind::UInt8),
    ("i16", PrimitiveKind::Int16),
    ("i16s", PrimitiveKind::Int16S),
    ("u16", PrimitiveKind::UInt16),
    ("u16s", PrimitiveKind::UInt16S),
    ("i32", PrimitiveKind::Int32),
    ("i32s", PrimitiveKind::Int32S),
    ("u32", PrimitiveKind::UInt32),
    ("u32s", PrimitiveKind::UInt32S),
    ("i64", PrimitiveKind::Int64),
    ("i64s", PrimitiveKind::Int64S),
    ("u64", PrimitiveKind::UInt64),
    ("u64s", PrimitiveKind::UInt64S),
    ("f32", PrimitiveKind::Float32),
    ("f64", PrimitiveKind::Float64),
    ("str", PrimitiveKind::String),
    ("str16", PrimitiveKind::String16),
    ("str32", PrimitiveKind::String32),
    ("ptr", PrimitiveKind::Pointer),
];

impl PrimitiveKind {
    /// Short keyword for scalar kinds (`i32`, `u16s`, `ptr`...).
    #[must_use]
    pub fn keyword(self) -> &'static str {
        KEYWORDS
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(name, _)| *name)
            .unwrap_or(match self {
                PrimitiveKind::Callback => "callback",
                PrimitiveKind::Record => "record",
                PrimitiveKind::Union => "union",
                PrimitiveKind::Array => "array",
                _ => "prototype",
            })
    }

    /// Looks up a scalar kind by keyword. Aggregates have no keyword.
    #[must_use]
    pub fn from_keyword(name: &str) -> Option<PrimitiveKind> {
        KEYWORDS
            .iter()
            .find(|(keyword, _)| *keyword == name)
            .map(|(_, kind)| *kind)
    }

    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Int8
                | PrimitiveKind::UInt8
                | PrimitiveKind::Int16
                | PrimitiveKind::Int16S
                | PrimitiveKind::UInt16
                | PrimitiveKind::UInt16S
                | PrimitiveKind::Int32
                | PrimitiveKind::Int32S
                | PrimitiveKind::UInt32
                | PrimitiveKind::UInt32S
                | PrimitiveKind::Int64
                | PrimitiveKind::Int64S
                | PrimitiveKind::UInt64
                | PrimitiveKind::UInt64S
        )
    }

    #[must_use]
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Int8
                | PrimitiveKind::Int16
                | PrimitiveKind::Int16S
                | PrimitiveKind::Int32
                | PrimitiveKind::Int32S
                | PrimitiveKind::Int64
                | PrimitiveKind::Int64S
        )
    }

    /// Byte-swapped ("S") integer kinds store the opposite byte order of
    /// the target.
    #[must_use]
    pub fn is_swapped(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Int16S
                | PrimitiveKind::UInt16S
                | PrimitiveKind::Int32S
                | PrimitiveKind::UInt32S
                | PrimitiveKind::Int64S
                | PrimitiveKind::UInt64S
        )
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, PrimitiveKind::Float32 | PrimitiveKind::Float64)
    }

    #[must_use]
    pub fn is_string(self) -> bool {
        matches!(
            self,
            PrimitiveKind::String | PrimitiveKind::String16 | PrimitiveKind::String32
        )
    }

    /// Kinds that occupy one pointer-sized slot.
    #[must_use]
    pub fn is_pointer_like(self) -> bool {
        matches!(self, PrimitiveKind::Pointer | PrimitiveKind::Callback) || self.is_string()
    }

    #[must_use]
    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            PrimitiveKind::Record | PrimitiveKind::Union | PrimitiveKind::Array
        )
    }

    /// Integer-class scalars: anything an ABI puts in a general register.
    #[must_use]
    pub fn is_integral(self) -> bool {
        self == PrimitiveKind::Bool || self.is_integer() || self.is_pointer_like()
    }

    /// Code unit width of a string kind.
    #[must_use]
    pub fn char_size(self) -> usize {
        match self {
            PrimitiveKind::String16 => 2,
            PrimitiveKind::String32 => 4,
            _ => 1,
        }
    }

    /// Size and alignment of a scalar kind under `model`, `None` for
    /// aggregates and prototypes.
    #[must_use]
    pub fn scalar_layout(self, model: DataModel) -> Option<(usize, usize)> {
        let layout = match self {
            PrimitiveKind::Void => (0, 1),
            PrimitiveKind::Bool | PrimitiveKind::Int8 | PrimitiveKind::UInt8 => (1, 1),
            PrimitiveKind::Int16
            | PrimitiveKind::Int16S
            | PrimitiveKind::UInt16
            | PrimitiveKind::UInt16S => (2, 2),
            PrimitiveKind::Int32
            | PrimitiveKind::Int32S
            | PrimitiveKind::UInt32
            | PrimitiveKind::UInt32S
            | PrimitiveKind::Float32 => (4, 4),
            PrimitiveKind::Int64
            | PrimitiveKind::Int64S
            | PrimitiveKind::UInt64
            | PrimitiveKind::UInt64S => (8, model.int64_align),
            PrimitiveKind::Float64 => (8, model.float64_align),
            PrimitiveKind::String
            | PrimitiveKind::String16
            | PrimitiveKind::String32
            | PrimitiveKind::Pointer
            | PrimitiveKind::Callback => (model.pointer_size, model.pointer_size),
            PrimitiveKind::Record
            | PrimitiveKind::Union
            | PrimitiveKind::Array
            | PrimitiveKind::Prototype => return None,
        };
        Some(layout)
    }
}
