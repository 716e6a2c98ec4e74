// Wire codecs: pure parsing and framing, no I/O

pub mod nmea;
pub mod power;
