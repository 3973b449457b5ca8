pub mod bus;

pub use bus::{Channel, FanoutHub, PushInterval, StreamEvent, StreamFrame, Subscriber};
