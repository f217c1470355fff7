// SoundWatch - Firmware Core
//
// Polls a Modbus sound-level module, aggregates the readings into one-minute
// windows and delivers them to an MQTT broker over Wi-Fi. Telemetry that
// cannot be delivered is kept in a persistent backlog and replayed, in order,
// when the broker session comes back.
//
// Hardware-facing collaborators sit behind the traits in `drivers`, `net`,
// `storage`, `clock` and `display`; `platform` provides the ESP-IDF
// implementations on the device and a simulated board everywhere else.

pub mod clock;
pub mod config;
pub mod display;
pub mod drivers;
pub mod error;
pub mod events;
pub mod input;
pub mod net;
pub mod platform;
pub mod storage;
pub mod tasks;
pub mod window;
