// SoundWatch - Status Display
//
// The panel renderer itself is an external collaborator. It receives the most
// recent reading and the connectivity flags once per received reading.

use crate::events::DisplayStatus;

pub trait StatusDisplay: Send {
    fn show(&mut self, status: &DisplayStatus);
}

/// Display that writes connectivity transitions to the log and nothing else.
#[derive(Default)]
pub struct LogDisplay {
    last_online: Option<bool>,
}

impl LogDisplay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusDisplay for LogDisplay {
    fn show(&mut self, status: &DisplayStatus) {
        let online = status.online();
        if self.last_online == Some(online) {
            log::debug!("{:.1} dB", status.value_db);
            return;
        }
        self.last_online = Some(online);

        if online {
            log::info!("Status: broker connected ({:.1} dB)", status.value_db);
        } else {
            log::info!(
                "Status: running locally, wifi {} ({:.1} dB)",
                if status.link_up { "up" } else { "down" },
                status.value_db
            );
        }
    }
}
