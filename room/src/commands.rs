use crate::state::VoiceSnapshot;
use room_core::{Error, PeerId};
use tokio::sync::{mpsc, oneshot};

/// Local user actions delivered to the voice handler
#[derive(Debug)]
pub enum VoiceCommand {
    Join {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    ToggleLocalMute {
        reply: oneshot::Sender<bool>,
    },
    ToggleRemoteMute {
        peer_id: PeerId,
        reply: oneshot::Sender<Result<bool, Error>>,
    },
    Snapshot {
        reply: oneshot::Sender<VoiceSnapshot>,
    },
    /// Leave and stop the handler
    Shutdown,
}

/// Cloneable front end to a running [`VoiceHandler`](crate::VoiceHandler)
#[derive(Clone)]
pub struct VoiceHandle {
    command_tx: mpsc::Sender<VoiceCommand>,
}

impl VoiceHandle {
    pub(crate) fn new(command_tx: mpsc::Sender<VoiceCommand>) -> Self {
        Self { command_tx }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> VoiceCommand) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| Error::InvalidState("Voice handler is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::InvalidState("Voice handler dropped the request".to_string()))
    }

    pub async fn join(&self) -> Result<(), Error> {
        self.request(|reply| VoiceCommand::Join { reply }).await?
    }

    pub async fn leave(&self) -> Result<(), Error> {
        self.request(|reply| VoiceCommand::Leave { reply }).await
    }

    pub async fn toggle_local_mute(&self) -> Result<bool, Error> {
        self.request(|reply| VoiceCommand::ToggleLocalMute { reply }).await
    }

    pub async fn toggle_remote_mute(&self, peer_id: PeerId) -> Result<bool, Error> {
        self.request(|reply| VoiceCommand::ToggleRemoteMute { peer_id, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<VoiceSnapshot, Error> {
        self.request(|reply| VoiceCommand::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        self.command_tx
            .send(VoiceCommand::Shutdown)
            .await
            .map_err(|_| Error::InvalidState("Voice handler is not running".to_string()))
    }
}
