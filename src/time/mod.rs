pub mod session;
pub mod holidays;
pub mod retention;

pub use session::{market_date, start_of_market_day};
pub use holidays::{is_trading_day, next_trading_day, previous_trading_day};
pub use retention::last_retained_instant;
