//! Handshake flows run inside a session's read task.
//!
//! The login listener authenticates and hands out the game server address;
//! the game listener authenticates again, turns compression on and then
//! forwards everything to the world actor.

pub mod game;
pub mod login;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::game::hash_password;
use crate::protocol::server::deny;
use crate::protocol::{ClientPacket, ServerPacket};
use crate::session::{NetState, Service, SessionContext, SessionError};
use crate::world::{AuthGrant, Request};

/// How long a handshake waits on the world before giving up.
const WORLD_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Routes one decoded packet for the listener that accepted the session.
pub async fn dispatch(
    service: Service,
    session: &Arc<NetState>,
    packet: ClientPacket,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    match packet {
        ClientPacket::Disconnect => return Err(SessionError::ClientDisconnect),
        ClientPacket::Ping { sequence } => {
            session.send(ServerPacket::Ping { sequence });
            return Ok(());
        }
        ClientPacket::ClientVersion { ref version } => {
            tracing::info!("[session] [version] id={} client={}", session.id(), version);
            return Ok(());
        }
        ClientPacket::GeneralInfo { subcommand, ref data } => {
            tracing::trace!(
                "[session] [info] id={} subcommand={:#06X} len={}",
                session.id(),
                subcommand,
                data.len()
            );
            return Ok(());
        }
        _ => {}
    }

    match service {
        Service::Login => login::handle(session, packet, ctx).await,
        Service::Game => game::handle(session, packet, ctx).await,
    }
}

/// Asks the world to authenticate (or create) the account. The error is
/// the reason byte for a login-denied reply.
async fn authenticate(
    session: &Arc<NetState>,
    ctx: &SessionContext,
    username: &str,
    password: &str,
) -> Result<AuthGrant, u8> {
    let (tx, rx) = oneshot::channel();
    let request = Request::Authenticate {
        session: session.clone(),
        username: username.to_string(),
        password_hash: hash_password(password),
        reply: tx,
    };
    if !ctx.world.send_request(request) {
        return Err(deny::COMMUNICATION);
    }

    match tokio::time::timeout(WORLD_REPLY_TIMEOUT, rx).await {
        Ok(Ok(Ok(grant))) => Ok(grant),
        Ok(Ok(Err(e))) => {
            tracing::info!(
                "[session] [auth] id={} username={} denied: {}",
                session.id(),
                username,
                e
            );
            Err(e.deny_reason())
        }
        Ok(Err(_)) | Err(_) => {
            tracing::warn!(
                "[session] [auth] id={} username={} world did not answer",
                session.id(),
                username
            );
            Err(deny::COMMUNICATION)
        }
    }
}
