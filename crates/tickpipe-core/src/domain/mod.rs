mod granularity;
mod instrument;
mod record;
mod symbol;
mod timestamp;
mod window;

pub use granularity::Granularity;
pub use instrument::{AssetClass, Instrument, InstrumentId};
pub use record::{DataKind, Record, RecordFields};
pub use symbol::Symbol;
pub use timestamp::UtcDateTime;
pub use window::{SessionCalendar, TimeWindow};
