pub mod clock;
pub mod market;

pub use clock::{Clock, SystemClock};
pub use market::MarketCalendar;
