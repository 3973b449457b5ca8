pub mod account;
pub mod liquidation;
pub mod matcher;

pub use account::{Account, AccountView, Position, PositionStatus};
pub use matcher::{EntryIntent, MatchEvent, MatchOutcome, Matcher};
