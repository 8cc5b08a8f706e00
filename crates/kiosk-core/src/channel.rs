use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{SessionCommand, SessionConfig, SessionEvent};

/// Broadcast event stream handed to UI subscribers.
pub type EventStream = broadcast::Receiver<SessionEvent>;

#[derive(Debug, Error)]
pub enum SessionChannelError {
    /// The session task is gone.
    #[error("session command channel is closed")]
    CommandChannelClosed,
}

/// UI half of a session's channels. Cloned into every handle.
#[derive(Clone, Debug)]
pub struct SessionChannels {
    command_tx: mpsc::Sender<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
}

/// Runtime half: the command queue plus the emitting side of the event
/// fan-out. It holds no command sender, so the queue closes once every
/// [`SessionChannels`] clone is dropped.
#[derive(Debug)]
pub struct SessionInbox {
    pub commands: mpsc::Receiver<SessionCommand>,
    pub events: broadcast::Sender<SessionEvent>,
}

impl SessionChannels {
    /// Open the channels for one session, sized from `config`.
    pub fn open(config: &SessionConfig) -> (Self, SessionInbox) {
        let (command_tx, commands) = mpsc::channel(config.command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let inbox = SessionInbox {
            commands,
            events: event_tx.clone(),
        };

        (
            Self {
                command_tx,
                event_tx,
            },
            inbox,
        )
    }

    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    pub async fn send_command(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SessionChannelError::CommandChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionStatus;

    fn open(command_buffer: usize, event_buffer: usize) -> (SessionChannels, SessionInbox) {
        let mut config = SessionConfig::new("board-1");
        config.command_buffer = command_buffer;
        config.event_buffer = event_buffer;
        SessionChannels::open(&config)
    }

    #[tokio::test]
    async fn commands_reach_the_inbox() {
        let (channels, mut inbox) = open(8, 8);
        channels
            .send_command(SessionCommand::DragStart { id: "s1".into() })
            .await
            .expect("command send should work");

        let cmd = inbox.commands.recv().await.expect("inbox should have a command");
        assert_eq!(cmd, SessionCommand::DragStart { id: "s1".into() });
    }

    #[tokio::test]
    async fn inbox_events_fan_out_to_every_subscriber() {
        let (channels, inbox) = open(4, 16);
        let mut a = channels.subscribe();
        let mut b = channels.subscribe();

        inbox
            .events
            .send(SessionEvent::StatusChanged {
                status: SessionStatus::Ready,
            })
            .expect("two subscribers are listening");

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[tokio::test]
    async fn dropping_every_handle_closes_the_command_queue() {
        let (channels, mut inbox) = open(4, 4);
        let clone = channels.clone();
        drop(channels);
        drop(clone);

        assert_eq!(inbox.commands.recv().await, None);
    }

    #[tokio::test]
    async fn zero_buffers_are_clamped() {
        let (channels, mut inbox) = open(0, 0);
        channels
            .send_command(SessionCommand::Shutdown)
            .await
            .expect("a one-slot queue accepts a command");
        assert_eq!(inbox.commands.recv().await, Some(SessionCommand::Shutdown));
    }

    #[tokio::test]
    async fn reports_a_closed_command_queue() {
        let (channels, inbox) = open(1, 1);
        drop(inbox);
        let err = channels
            .send_command(SessionCommand::Shutdown)
            .await
            .expect_err("send must fail once the inbox is gone");
        assert!(matches!(err, SessionChannelError::CommandChannelClosed));
    }
}
