//! Types shared by the radio-streamer daemon: configuration, the persisted
//! station/volume selection, the station list and the control vocabulary.

pub mod config;
pub mod platform;
pub mod protocol;
pub mod selection;
pub mod stations;
