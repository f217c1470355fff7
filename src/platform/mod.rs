// SoundWatch - Board Selection
//
// Both boards export the same surface: `init_logging`, `Board::take`,
// `start_broker`, `start_time_sync`, `install_button` and the collaborator
// type aliases `Serial`, `Link`, `Broker`, `FlashVolume` and `TimeSync`.

#[cfg(target_os = "espidf")]
mod esp;
#[cfg(target_os = "espidf")]
pub use esp::*;

#[cfg(not(target_os = "espidf"))]
mod sim;
#[cfg(not(target_os = "espidf"))]
pub use sim::*;
