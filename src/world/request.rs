use std::sync::Arc;

use tokio::sync::oneshot;

use crate::game::{AccountError, MapError, ObjectError, Roles, Serial, TemplateError};
use crate::protocol::{ClientPacket, ServerPacket};
use crate::session::NetState;

use super::{World, REMOVE_PLAYER};

/// What a successful login hands back to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub username: String,
    pub roles: Roles,
    /// Names shown on the character list
    pub characters: Vec<String>,
}

/// Everything the world actor can be asked to do.
pub enum Request {
    /// An in-game packet from a session with a character attached
    ClientPacket {
        session: Arc<NetState>,
        packet: ClientPacket,
    },
    Authenticate {
        session: Arc<NetState>,
        username: String,
        password_hash: String,
        reply: oneshot::Sender<Result<AuthGrant, AccountError>>,
    },
    CharacterLogin {
        session: Arc<NetState>,
        slot: u32,
    },
    /// Posted once a session's tasks have exited with a player attached
    CharacterLogout { player: Serial },
    /// Read-only access from outside the actor
    Query(Box<dyn FnOnce(&World) + Send>),
    /// Stops the actor after a final save
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("You are not in the world.")]
    NotInWorld,

    #[error("No account is bound to this connection.")]
    NoAccount,

    #[error("That no longer exists.")]
    NotFound(Serial),

    #[error("You must wait to perform another action.")]
    TooFast,

    #[error("That is too far away.")]
    OutOfReach(Serial),

    #[error("You are not holding that.")]
    NotHolding(Serial),

    #[error("You cannot put that there.")]
    Object(#[from] ObjectError),

    #[error("You cannot go there.")]
    Map(#[from] MapError),

    #[error("Character creation failed: {0}")]
    Template(#[from] TemplateError),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::ClientPacket { .. } => "ClientPacket",
            Request::Authenticate { .. } => "Authenticate",
            Request::CharacterLogin { .. } => "CharacterLogin",
            Request::CharacterLogout { .. } => "CharacterLogout",
            Request::Query(_) => "Query",
            Request::Shutdown => "Shutdown",
        }
    }

    /// The session errors are reported back to, if any.
    pub fn session(&self) -> Option<&Arc<NetState>> {
        match self {
            Request::ClientPacket { session, .. }
            | Request::Authenticate { session, .. }
            | Request::CharacterLogin { session, .. } => Some(session),
            Request::CharacterLogout { .. } | Request::Query(_) | Request::Shutdown => None,
        }
    }

    pub fn execute(self, world: &mut World) -> Result<(), RequestError> {
        match self {
            Request::ClientPacket { session, packet } => world.handle_packet(&session, packet),
            Request::Authenticate {
                session,
                username,
                password_hash,
                reply,
            } => {
                let result = world.authenticate(&username, &password_hash);
                if let Err(e) = &result {
                    tracing::info!(
                        "[world] [auth] id={} username={} rejected: {}",
                        session.id(),
                        username,
                        e
                    );
                }
                if reply.send(result).is_err() {
                    tracing::debug!("[world] [auth] id={} gave up waiting", session.id());
                }
                Ok(())
            }
            Request::CharacterLogin { session, slot } => world.character_login(&session, slot),
            Request::CharacterLogout { player } => {
                world.character_logout(player);
                Ok(())
            }
            Request::Query(f) => {
                f(world);
                Ok(())
            }
            Request::Shutdown => Ok(()),
        }
    }
}

impl World {
    pub(super) fn authenticate(&mut self, username: &str, password_hash: &str) -> Result<AuthGrant, AccountError> {
        let account = self.accounts.authenticate_or_create(username, password_hash)?;
        Ok(AuthGrant {
            username: account.username.clone(),
            roles: account.roles,
            characters: vec![account.username.clone()],
        })
    }

    /// Puts the account's character in the world and binds it to `session`.
    ///
    /// The character is found in the live store (logged out but still in
    /// its grace period), in deep storage, or created from a template on
    /// first entry.
    pub(super) fn character_login(&mut self, session: &Arc<NetState>, slot: u32) -> Result<(), RequestError> {
        if session.is_disconnected() {
            return Ok(());
        }
        let username = session.account().ok_or(RequestError::NoAccount)?;
        let (roles, existing) = {
            let account = self.accounts.get(&username).ok_or(RequestError::NoAccount)?;
            (account.roles, account.player)
        };

        let (serial, fresh) = match existing {
            Some(serial) if self.store.mobile(serial).is_some() => {
                self.timers.cancel_matching(REMOVE_PLAYER, serial);
                (serial, false)
            }
            Some(serial) if self.deep.contains_key(&serial) => {
                if let Some(tree) = self.deep.remove(&serial) {
                    for object in tree {
                        self.store.insert(object);
                    }
                }
                (serial, false)
            }
            _ => {
                let template = if roles.is_staff() { "GameMaster" } else { "Player" };
                (self.templates.create_by_name(template, &mut self.store)?, true)
            }
        };

        let start = self.config.start_location;
        let mobile = self
            .store
            .mobile_mut(serial)
            .ok_or(RequestError::NotFound(serial))?;
        mobile.name = username.clone();
        mobile.account = Some(username.clone());
        let wanted = if fresh { start } else { mobile.location };
        mobile.location = self.map.force_add_object(serial, wanted);

        if let Some(account) = self.accounts.get_mut(&username) {
            account.player = Some(serial);
        }
        self.store.recalculate();

        if let Some(old) = self.players.insert(serial, session.clone()) {
            if old.id() != session.id() {
                old.take_player();
                old.disconnect("character logged in elsewhere");
            }
        }
        session.attach_player(serial);
        tracing::info!(
            "[world] [login] id={} username={} player={} slot={} fresh={}",
            session.id(),
            username,
            serial,
            slot,
            fresh
        );

        self.send_enter_world(session, serial);
        self.mark_dirty(serial);
        Ok(())
    }

    fn send_enter_world(&self, session: &NetState, serial: Serial) {
        let Some(mobile) = self.store.mobile(serial) else {
            return;
        };
        let meta = self.map.meta();
        session.send(ServerPacket::LoginConfirm {
            serial,
            body: mobile.body,
            location: mobile.location,
            facing: mobile.facing,
            map_width: meta.width,
            map_height: meta.height,
        });
        session.send(ServerPacket::Light { level: 0 });
        session.send(self.draw_player(mobile));
        session.send(self.draw_object(mobile));
        session.send(ServerPacket::WarMode { war: mobile.war_mode });
        session.send_optional(self.status_packet(serial, true));
        self.send_area(session, &mobile.location, serial);
        session.send(ServerPacket::LoginComplete);
    }

    /// Unbinds a character whose connection is gone and starts its grace
    /// period. A logout for a character already bound to a live session
    /// (it logged in again first) is stale and ignored.
    pub(super) fn character_logout(&mut self, player: Serial) {
        if let Some(session) = self.players.get(&player) {
            if !session.is_disconnected() {
                tracing::debug!(
                    "[world] [logout] player={} is bound to live session id={}, ignoring",
                    player,
                    session.id()
                );
                return;
            }
        }
        self.players.remove(&player);
        self.return_held(player);
        self.schedule_removal(player);
        tracing::info!(
            "[world] [logout] player={} leaves in {}s",
            player,
            self.config.logout_grace_secs
        );
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{drain, open_session, test_world};
    use super::*;
    use crate::game::hash_password;

    #[tokio::test]
    async fn test_first_account_is_superuser_and_gets_game_master() {
        let mut world = test_world();
        let grant = world.authenticate("alice", &hash_password("pw1")).unwrap();
        assert!(grant.roles.is_superuser());
        assert_eq!(grant.characters, vec!["alice".to_string()]);

        let second = world.authenticate("bob", &hash_password("pw2")).unwrap();
        assert_eq!(second.roles, Roles::PLAYER);

        let (session, mut rx) = open_session(&world);
        session.set_account("alice");
        world.character_login(&session, 0).unwrap();
        let player = session.player().unwrap();
        assert_eq!(world.store.mobile(player).unwrap().template, "GameMaster");

        let packets = drain(&mut rx);
        assert!(matches!(packets.first(), Some(ServerPacket::LoginConfirm { serial, .. }) if *serial == player));
        assert_eq!(packets.last(), Some(&ServerPacket::LoginComplete));
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let mut world = test_world();
        world.authenticate("alice", &hash_password("pw1")).unwrap();
        assert_eq!(
            world.authenticate("alice", &hash_password("nope")),
            Err(AccountError::WrongPassword)
        );
    }

    #[tokio::test]
    async fn test_second_login_takes_over_character() {
        let mut world = test_world();
        world.authenticate("zed", &hash_password("pw")).unwrap();

        let (first, _rx1) = open_session(&world);
        first.set_account("zed");
        world.character_login(&first, 0).unwrap();
        let player = first.player().unwrap();

        let (second, _rx2) = open_session(&world);
        second.set_account("zed");
        world.character_login(&second, 0).unwrap();

        assert!(first.is_disconnected());
        assert_eq!(first.player(), None);
        assert_eq!(second.player(), Some(player));
        assert!(Arc::ptr_eq(world.session_of(player).unwrap(), &second));
    }

    #[tokio::test]
    async fn test_authenticate_request_replies() {
        let mut world = test_world();
        let (session, _rx) = open_session(&world);
        let (tx, rx) = oneshot::channel();
        world.execute(Request::Authenticate {
            session,
            username: "alice".into(),
            password_hash: hash_password("pw1"),
            reply: tx,
        });
        let grant = rx.await.unwrap().unwrap();
        assert_eq!(grant.username, "alice");
        assert!(world.accounts().superuser().is_some());
    }
}
