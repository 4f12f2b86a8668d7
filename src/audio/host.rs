//! Owner of the single active playthrough session
//!
//! The host keeps the selected device pair and rebuilds the session when
//! the pair changes, when a stream reports an error, or when the input
//! device's format changes underneath it. A rebuilt session is restarted
//! if the old one was running.

use std::sync::mpsc::{self, Receiver, Sender};

use super::device::{find_device, AudioDevice, DeviceFormat};
use super::session::{Playthrough, PlaythroughConfig, PlaythroughError, SessionEvent};

/// Why [`PlaythroughHost::poll`] rebuilt the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    StreamError { is_input: bool, message: String },
    InputFormatChanged { from: DeviceFormat, to: DeviceFormat },
}

pub struct PlaythroughHost {
    config: PlaythroughConfig,
    input: AudioDevice,
    output: AudioDevice,
    input_format: DeviceFormat,
    session: Option<Playthrough>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl PlaythroughHost {
    /// Create a host with a stopped session between `input` and `output`
    pub fn new(input: AudioDevice, output: AudioDevice, config: PlaythroughConfig) -> Result<Self, PlaythroughError> {
        let (events_tx, events_rx) = mpsc::channel();
        let input_format = input.format();
        let mut host = Self {
            config,
            input,
            output,
            input_format,
            session: None,
            events_tx,
            events_rx,
        };
        host.create_playthrough()?;
        Ok(host)
    }

    /// Build a session for the current device pair, replacing any existing one
    pub fn create_playthrough(&mut self) -> Result<(), PlaythroughError> {
        self.delete_playthrough();
        let session = Playthrough::new(&self.input, &self.output, &self.config, self.events_tx.clone())?;
        self.session = Some(session);
        Ok(())
    }

    /// Stop and drop the session, if any
    pub fn delete_playthrough(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.stop() {
                log::warn!("Error stopping playthrough: {}", e);
            }
        }
        // Events from the old streams no longer apply
        while self.events_rx.try_recv().is_ok() {}
    }

    /// Tear down and rebuild for the same pair, restarting if it was running
    pub fn reset_playthrough(&mut self) -> Result<(), PlaythroughError> {
        let was_running = self.is_running();
        self.refresh_devices()?;
        self.create_playthrough()?;
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Switch to a new device pair, keeping the running state
    pub fn set_devices(&mut self, input: AudioDevice, output: AudioDevice) -> Result<(), PlaythroughError> {
        let was_running = self.is_running();
        self.delete_playthrough();
        self.input_format = input.format();
        self.input = input;
        self.output = output;
        self.create_playthrough()?;
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), PlaythroughError> {
        match self.session.as_mut() {
            Some(session) => session.start(),
            None => Ok(()),
        }
    }

    pub fn stop(&mut self) -> Result<(), PlaythroughError> {
        match self.session.as_mut() {
            Some(session) => session.stop(),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(Playthrough::is_running)
    }

    pub fn session(&self) -> Option<&Playthrough> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Playthrough> {
        self.session.as_mut()
    }

    pub fn input(&self) -> &AudioDevice {
        &self.input
    }

    pub fn output(&self) -> &AudioDevice {
        &self.output
    }

    /// Handle pending stream errors and input format changes
    ///
    /// Returns the reason when the session was rebuilt.
    pub fn poll(&mut self) -> Result<Option<RebuildReason>, PlaythroughError> {
        let reason = match self.events_rx.try_recv() {
            Ok(SessionEvent::StreamError { is_input, message }) => Some(RebuildReason::StreamError { is_input, message }),
            Err(_) => self.check_input_format(),
        };

        let Some(reason) = reason else {
            return Ok(None);
        };

        log::warn!("Rebuilding playthrough: {:?}", reason);
        self.reset_playthrough()?;
        Ok(Some(reason))
    }

    fn check_input_format(&mut self) -> Option<RebuildReason> {
        match self.input.current_format() {
            Ok(format) if format != self.input_format => Some(RebuildReason::InputFormatChanged {
                from: self.input_format,
                to: format,
            }),
            Ok(_) => None,
            Err(e) => {
                log::debug!("Could not query input format: {}", e);
                None
            }
        }
    }

    /// Re-resolve both devices by name so their default formats are current
    fn refresh_devices(&mut self) -> Result<(), PlaythroughError> {
        // The old session holds streams on the old handles
        self.delete_playthrough();
        let input = find_device(Some(self.input.name()), true)?;
        let output = find_device(Some(self.output.name()), false)?;
        self.input_format = input.format();
        self.input = input;
        self.output = output;
        Ok(())
    }
}

impl Drop for PlaythroughHost {
    fn drop(&mut self) {
        self.delete_playthrough();
    }
}
