//! Single point through which commands reach the vehicle.
//!
//! The mission sequencer and the manual control loop both hold an
//! `Arc<Commander>`. A command session owns the link for the duration of one
//! action, so setpoints from the two paths are never interleaved.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::FlightResult;
use crate::link::{Command, VehicleLink};
use crate::vehicle::{FlightMode, VehicleState};

pub struct Commander {
    link: Arc<dyn VehicleLink>,
    gate: Mutex<()>,
}

impl Commander {
    pub fn new(link: Arc<dyn VehicleLink>) -> Self {
        Self {
            link,
            gate: Mutex::new(()),
        }
    }

    /// Reads do not take the command gate.
    pub async fn read_state(&self) -> FlightResult<VehicleState> {
        self.link.read_state().await
    }

    /// Waits for exclusive command access.
    pub async fn session(&self) -> CommandSession<'_> {
        CommandSession {
            link: self.link.as_ref(),
            _guard: self.gate.lock().await,
        }
    }
}

pub struct CommandSession<'a> {
    link: &'a dyn VehicleLink,
    _guard: MutexGuard<'a, ()>,
}

impl CommandSession<'_> {
    pub async fn send(&self, command: Command) -> FlightResult<()> {
        debug!("Sending command: {:?}", command);
        self.link.send_command(command).await
    }

    pub async fn set_mode(&self, mode: FlightMode) -> FlightResult<()> {
        debug!("Requesting mode {}", mode);
        self.link.set_mode(mode).await
    }

    pub async fn read_state(&self) -> FlightResult<VehicleState> {
        self.link.read_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLink;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_exclusive() {
        let link = Arc::new(MockLink::hovering());
        let commander = Arc::new(Commander::new(link.clone()));

        let first = commander.session().await;

        let contender = {
            let commander = commander.clone();
            tokio::spawn(async move {
                let session = commander.session().await;
                session.send(Command::Disarm).await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        first.send(Command::stop()).await.unwrap();
        first.send(Command::stop()).await.unwrap();
        drop(first);

        contender.await.unwrap().unwrap();
        assert_eq!(
            link.commands(),
            vec![Command::stop(), Command::stop(), Command::Disarm]
        );
    }
}
