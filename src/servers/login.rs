use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::protocol::server::deny;
use crate::protocol::{ClientPacket, ServerEntry, ServerPacket};
use crate::session::{NetState, SessionContext, SessionError};

pub(super) async fn handle(
    session: &Arc<NetState>,
    packet: ClientPacket,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    match packet {
        ClientPacket::AccountLogin { username, password, .. } => {
            match super::authenticate(session, ctx, &username, &password).await {
                Ok(grant) => {
                    session.set_account(&grant.username);
                    session.send(ServerPacket::ServerList {
                        servers: vec![server_entry(ctx)],
                    });
                }
                Err(reason) => {
                    session.send(ServerPacket::LoginDenied { reason });
                }
            }
        }
        ClientPacket::SelectServer { index } => {
            let Some(account) = session.account() else {
                session.send(ServerPacket::LoginDenied { reason: deny::BAD_CREDENTIALS });
                return Ok(());
            };
            let key: u32 = rand::random();
            tracing::info!(
                "[login] [select] id={} account={} server={} key={:#010x}",
                session.id(),
                account,
                index,
                key
            );
            session.send(ServerPacket::Connect {
                address: game_address(ctx),
                port: ctx.config.game_port,
                key,
            });
        }
        other => {
            tracing::debug!(
                "[login] [ignored] id={} packet={:#04X}",
                session.id(),
                other.id()
            );
        }
    }
    Ok(())
}

fn game_address(ctx: &SessionContext) -> Ipv4Addr {
    ctx.config.game_ip.parse().unwrap_or(Ipv4Addr::LOCALHOST)
}

fn server_entry(ctx: &SessionContext) -> ServerEntry {
    ServerEntry {
        index: 0,
        name: ctx.config.server_name.clone(),
        percent_full: 0,
        timezone: 0,
        address: game_address(ctx),
    }
}
