use std::sync::Arc;

use crate::protocol::server::{deny, StartingCity};
use crate::protocol::{CharacterEntry, ClientPacket, ServerPacket};
use crate::session::{NetState, SessionContext, SessionError};
use crate::world::Request;

/// Feature bits sent ahead of the character list.
const FEATURES: u16 = 0x8003;

/// Character list flags: context menus, one character per account.
const CHARACTER_LIST_FLAGS: u32 = 0x0000_0008 | 0x0000_0014;

pub(super) async fn handle(
    session: &Arc<NetState>,
    packet: ClientPacket,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    match packet {
        ClientPacket::GameLogin { key, username, password } => {
            if session.account().is_some() {
                tracing::debug!("[game] [login] id={} repeated game login", session.id());
                return Ok(());
            }
            tracing::debug!("[game] [login] id={} username={} key={:#010x}", session.id(), username, key);
            match super::authenticate(session, ctx, &username, &password).await {
                Ok(grant) => {
                    session.set_account(&grant.username);
                    session.enable_compression();
                    session.send(ServerPacket::Features { flags: FEATURES });
                    session.send(ServerPacket::CharacterList {
                        characters: grant
                            .characters
                            .into_iter()
                            .map(|name| CharacterEntry { name })
                            .collect(),
                        cities: vec![StartingCity {
                            name: "Britain".into(),
                            building: "Sweet Dreams Inn".into(),
                        }],
                        flags: CHARACTER_LIST_FLAGS,
                    });
                }
                Err(reason) => {
                    session.send(ServerPacket::LoginDenied { reason });
                }
            }
        }
        ClientPacket::PlayCharacter { slot, .. } => {
            if session.account().is_none() {
                session.send(ServerPacket::LoginDenied { reason: deny::BAD_CREDENTIALS });
                return Ok(());
            }
            if session.player().is_some() {
                return Ok(());
            }
            ctx.world.send_request(Request::CharacterLogin { session: session.clone(), slot });
        }
        packet => {
            if session.player().is_none() {
                tracing::debug!(
                    "[game] [ignored] id={} packet={:#04X} before entering the world",
                    session.id(),
                    packet.id()
                );
                return Ok(());
            }
            // a full queue loses this one request; the session stays up
            ctx.world.send_request(Request::ClientPacket { session: session.clone(), packet });
        }
    }
    Ok(())
}
