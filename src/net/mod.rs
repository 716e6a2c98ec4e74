pub mod channel;
pub mod ntrip;
