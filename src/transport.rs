//! How a session talks to its backup client.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::Result;
use crate::protocol::{ClientMessage, FrameCodec, Message, ServerMessage};

#[async_trait::async_trait]
pub trait ClientLink: Send {
    /// The next client message, or `None` once the client hung up.
    async fn recv(&mut self) -> Result<Option<ClientMessage>>;

    async fn send(&mut self, message: ServerMessage) -> Result<()>;
}

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, FrameCodec> {
    Framed::new(io, FrameCodec)
}

#[async_trait::async_trait]
impl<T> ClientLink for Framed<T, FrameCodec>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<ClientMessage>> {
        match self.next().await {
            Some(frame) => Ok(Some(ClientMessage::from_frame(frame?)?)),
            None => Ok(None),
        }
    }

    async fn send(&mut self, message: ServerMessage) -> Result<()> {
        SinkExt::send(self, message.to_frame()?).await
    }
}
