mod common;

use std::time::Duration;

use common::{account_login, enter_world, game_login, temp_dir, test_config, Client, Running};
use uod::game::Roles;
use uod::protocol::{ClientPacket, ServerPacket};
use uod::protocol::server::deny;
use uod::save::SaveManager;

#[tokio::test]
async fn test_login_server_lists_shard_and_hands_out_connect() {
    let dir = temp_dir("login");
    let server = Running::start(test_config(&dir)).await;

    let mut client = Client::connect(server.login).await;
    client.send(account_login("alice", "pw1")).await;
    match client.recv().await {
        ServerPacket::ServerList { servers } => {
            assert_eq!(servers.len(), 1);
            assert_eq!(servers[0].name, "uod");
        }
        other => panic!("expected server list, got {:?}", other),
    }

    client.send(ClientPacket::SelectServer { index: 0 }).await;
    assert!(matches!(client.recv().await, ServerPacket::Connect { .. }));

    let accounts = server
        .world
        .query(|w| w.accounts().snapshot())
        .await
        .unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].username, "alice");
    assert_eq!(accounts[0].roles, Roles::SUPERUSER);

    server.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_first_game_login_gets_character_list_and_superuser() {
    let dir = temp_dir("first");
    let server = Running::start(test_config(&dir)).await;

    let mut client = Client::connect(server.game).await;
    client.send(game_login(0, "alice", "pw1")).await;
    client.expect_compression();
    let packets = client.recv_until(0xA9).await;
    match packets.last() {
        Some(ServerPacket::CharacterList { characters, .. }) => {
            assert_eq!(characters.len(), 1);
            assert_eq!(characters[0].name, "alice");
        }
        other => panic!("expected character list, got {:?}", other),
    }

    let accounts = server
        .world
        .query(|w| w.accounts().snapshot())
        .await
        .unwrap();
    assert_eq!(accounts.len(), 1);
    assert!(accounts[0].roles.is_superuser());

    server.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_wrong_password_is_denied() {
    let dir = temp_dir("deny");
    let server = Running::start(test_config(&dir)).await;

    let mut first = Client::connect(server.login).await;
    first.send(account_login("alice", "pw1")).await;
    first.recv().await;

    let mut second = Client::connect(server.game).await;
    second.send(game_login(7, "alice", "wrong")).await;
    assert_eq!(
        second.recv().await,
        ServerPacket::LoginDenied { reason: deny::BAD_PASSWORD }
    );

    server.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_enter_world_then_logout_moves_character_to_deep_storage() {
    let dir = temp_dir("enter");
    let server = Running::start(test_config(&dir)).await;

    let (client, player) = enter_world(server.game, "alice", "pw1").await;
    let online = server
        .world
        .query(move |w| w.session_of(player).is_some())
        .await
        .unwrap();
    assert!(online);

    drop(client);
    let mut stored = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stored = server
            .world
            .query(move |w| w.deep_storage().contains_key(&player) && w.find(player).is_none())
            .await
            .unwrap();
        if stored {
            break;
        }
    }
    assert!(stored, "character never left the world");

    server.stop().await;

    let loaded = SaveManager::new(&dir).load().unwrap().expect("shutdown save");
    assert!(loaded.deep.contains_key(&player));
    assert_eq!(loaded.accounts[0].player, Some(player));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_second_login_disconnects_first() {
    let dir = temp_dir("takeover");
    let server = Running::start(test_config(&dir)).await;

    let (mut first, player) = enter_world(server.game, "alice", "pw1").await;
    let (_second, again) = enter_world(server.game, "alice", "pw1").await;
    assert_eq!(player, again);
    assert!(first.closed().await);

    server.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_restart_restores_saved_world() {
    let dir = temp_dir("restart");

    let server = Running::start(test_config(&dir)).await;
    let (_client, player) = enter_world(server.game, "alice", "pw1").await;
    server.stop().await;

    let server = Running::start(test_config(&dir)).await;
    let (restored, superuser) = server
        .world
        .query(move |w| {
            (
                w.find(player).is_some() || w.deep_storage().contains_key(&player),
                w.accounts().superuser().map(|a| a.username.clone()),
            )
        })
        .await
        .unwrap();
    assert!(restored);
    assert_eq!(superuser.as_deref(), Some("alice"));

    let (_client, again) = enter_world(server.game, "alice", "pw1").await;
    assert_eq!(again, player);

    server.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}
