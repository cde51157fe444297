//! WebSocket transport for the relay
//!
//! Every accepted TCP connection is upgraded to a WebSocket and served on its
//! own task: a writer task drains the endpoint's outbound queue into the
//! socket while the reader loop feeds text frames to a [`Dispatcher`].

use crate::config::Config;
use crate::error::SignalingError;
use crate::handler::Dispatcher;
use crate::state::{Endpoint, RelayState};
use futures::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Upper bound on sending the close frame to a peer that may have stopped reading
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bind, serve until Ctrl-C, then stop
pub async fn run(config: Config) -> Result<(), SignalingError> {
    let listener = TcpListener::bind(config.bind_address).await?;
    info!(address = %listener.local_addr()?, "listening");

    let (state, receiver) = RelayState::new(config);
    let fan_out = state.broadcast.spawn_fan_out(receiver);

    tokio::select! {
        () = serve(listener, state) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("shutting down");
        }
    }
    fan_out.abort();
    Ok(())
}

/// Accept connections forever, one task per connection
pub async fn serve(listener: TcpListener, state: RelayState) {
    loop {
        let (stream, address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let state = state.clone();
        let _ = tokio::spawn(async move {
            if let Err(e) = handle_connection(state, stream, address).await {
                debug!(%address, error = %e, "connection ended with error");
            }
        });
    }
}

/// Serve one connection until its transport closes or it is evicted
pub async fn handle_connection(
    state: RelayState,
    stream: TcpStream,
    address: SocketAddr,
) -> Result<(), SignalingError> {
    let upgrade = tokio_tungstenite::accept_async(stream);
    let socket = tokio::time::timeout(state.config.handshake_timeout, upgrade)
        .await
        .map_err(|_| SignalingError::HandshakeTimeout)??;
    let (sink, mut source) = socket.split();

    let (endpoint, outbound) = state.new_endpoint();
    info!(peer = %endpoint.id, %address, "connected");
    let dispatcher = Dispatcher::open(state, Arc::clone(&endpoint));
    let writer = tokio::spawn(write_loop(sink, outbound, Arc::clone(&endpoint)));

    let result = loop {
        let frame = tokio::select! {
            () = endpoint.evicted() => break Ok(()),
            frame = source.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                let _ = dispatcher.handle_text(text.as_str()).await;
            }
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => break Err(e.into()),
        }
    };

    dispatcher.close();
    let _ = writer.await;
    result
}

/// Drain the outbound queue into the socket until the endpoint is evicted
async fn write_loop<S>(mut sink: S, mut outbound: mpsc::Receiver<Arc<str>>, endpoint: Arc<Endpoint>)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let message = tokio::select! {
            biased;
            () = endpoint.evicted() => break,
            message = outbound.recv() => message,
        };
        let Some(message) = message else { break };
        let sent = tokio::select! {
            biased;
            () = endpoint.evicted() => break,
            sent = sink.send(Message::text(message.to_string())) => sent,
        };
        if let Err(e) = sent {
            debug!(peer = %endpoint.id, error = %e, "write failed");
            endpoint.evict();
            break;
        }
    }
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    })
    .await;
}
