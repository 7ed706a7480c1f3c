use thiserror::Error;

/// Startup-time contract violations. These are fatal: the engine refuses to
/// start rather than clamp or guess.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{type_name}.{field}: type `{type_tag}` cannot be networked")]
    UnsupportedFieldType {
        type_name: String,
        field: String,
        type_tag: String,
    },
    #[error("{type_name}.{field}: only properties can be networked, found a plain field")]
    NotAProperty { type_name: String, field: String },
    #[error("{type_name}.{field} is declared twice")]
    DuplicateField { type_name: String, field: String },
    #[error("{type_name} declares no networked fields")]
    EmptyType { type_name: String },
    #[error("networked type `{0}` is registered twice")]
    DuplicateType(String),
    #[error("unknown networked type `{0}`")]
    UnknownType(String),
    #[error("{type_name} has no networked field `{field}`")]
    UnknownField { type_name: String, field: String },
    #[error("{type_name}.{field} is declared as {declared}, accessed as {requested}")]
    FieldKindMismatch {
        type_name: String,
        field: String,
        declared: &'static str,
        requested: &'static str,
    },
    #[error("pool for {type_name} exhausted (capacity {capacity})")]
    PoolExhausted { type_name: String, capacity: u32 },
    #[error("pool capacity for {type_name} must be non-zero")]
    ZeroPoolCapacity { type_name: String },
    #[error("{type_name} needs a {size} byte block, more than the {max} bytes a payload can carry")]
    BlockTooLarge {
        type_name: String,
        size: usize,
        max: usize,
    },
    #[error("too many networked types (max {max})")]
    TooManyTypes { max: usize },
    #[error("tick rate {0} Hz is outside 1..=1000")]
    InvalidTickRate(u32),
    #[error("history depth {history_depth} is shallower than the prediction window {max_predicted_ticks}")]
    HistoryTooShallow {
        history_depth: usize,
        max_predicted_ticks: u32,
    },
    #[error("fragment size {size} must be within {min}..={max}")]
    InvalidFragmentSize { size: usize, min: usize, max: usize },
    #[error("max bytes per tick {budget} cannot hold a payload header ({min} bytes)")]
    BudgetTooSmall { budget: usize, min: usize },
    #[error("max bytes per tick {budget} exceeds the {max} byte payload limit")]
    BudgetTooLarge { budget: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("read of {needed} bytes with only {available} remaining")]
    Underflow { needed: usize, available: usize },
    #[error("range {offset}..{end} lies outside a {len} byte region")]
    OutOfRange { offset: usize, end: usize, len: usize },
}

/// Wire-level failures. All of these are recoverable: the offending tick is
/// dropped and the sender redelivers from the last acknowledged tick.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Packet(#[from] crate::net::PacketError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fragment {index}/{count} of tick {tick} covers {offset}..{end} beyond total {total}")]
    FragmentOutOfRange {
        tick: u32,
        index: u16,
        count: u16,
        offset: usize,
        end: usize,
        total: usize,
    },
    #[error("fragment of tick {tick} disagrees with earlier fragments about the transmission shape")]
    FragmentMismatch { tick: u32 },
    #[error("payload for tick {tick} announces tick {announced}")]
    TickMismatch { tick: u32, announced: u32 },
    #[error("unknown networked type id {0}")]
    UnknownTypeId(u16),
    #[error("block for type {type_id} is {got} bytes, expected {expected}")]
    BlockSizeMismatch {
        type_id: u16,
        got: usize,
        expected: usize,
    },
    #[error("raw id {0:#x} does not name an entity")]
    InvalidNetworkId(u64),
    #[error("entity index {index} exceeds the meta table ({capacity})")]
    EntityIndexOutOfRange { index: u32, capacity: usize },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Resimulation could not be carried out faithfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResimError {
    #[error("desync: no recorded input for predicted tick {tick}")]
    MissingInput { tick: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("history entry {ticks_ago} ticks ago is unavailable (depth {depth}, captured {captured})")]
    Unavailable {
        ticks_ago: usize,
        depth: usize,
        captured: u64,
    },
    #[error("tick {0} is not held in history")]
    TickNotFound(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum LagCompError {
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("alpha {0} is outside 0..=1")]
    InvalidAlpha(f32),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Resim(#[from] ResimError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    LagComp(#[from] LagCompError),
}

pub type Result<T> = std::result::Result<T, Error>;
