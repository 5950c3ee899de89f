#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use relay_bus::LocalRelay;
    use serde_json::json;

    use crate::tests::support::{
        LOBBY, Participant, drain, eventually, fast_config, loopback, next_matching, participant,
        status_until,
    };
    use crate::transport::loopback::LoopbackNetwork;
    use crate::{MeshEvent, Payload};

    fn peers(p: &Participant) -> Vec<String> {
        p.channel.peers()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    /// alpha broadcasts, bravo then charlie join; returns once every pair is linked.
    async fn three_peer_mesh(
        relay: &Arc<LocalRelay>,
        make: impl Fn(&str) -> Participant,
    ) -> (Participant, Participant, Participant) {
        let alpha = make("alpha");
        alpha.channel.open(Some("room-1")).expect("open room");

        let bravo = make("bravo");
        bravo.channel.connect().expect("connect");
        eventually("alpha <-> bravo", || {
            peers(&alpha) == names(&["bravo"]) && peers(&bravo) == names(&["alpha"])
        })
        .await;

        let charlie = make("charlie");
        charlie.channel.connect().expect("connect");
        eventually("full mesh", || {
            peers(&alpha) == names(&["bravo", "charlie"])
                && peers(&bravo) == names(&["alpha", "charlie"])
                && peers(&charlie) == names(&["alpha", "bravo"])
        })
        .await;
        assert_eq!(relay.subscriber_count(LOBBY), 3);
        (alpha, bravo, charlie)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_three_peers_form_full_mesh_and_exchange_chunks() {
        let relay = Arc::new(LocalRelay::new());
        let network = LoopbackNetwork::new();
        let config = fast_config().with_chunk_size(5);
        let (alpha, mut bravo, mut charlie) = three_peer_mesh(&relay, |name| {
            participant(&relay, Arc::new(network.clone()), name, config.clone())
        })
        .await;
        assert!(alpha.channel.first_connection_opened());

        let chunks = alpha.channel.send("hello world").await.expect("send");
        assert_eq!(chunks, 3);

        for receiver in [&mut bravo, &mut charlie] {
            let event = next_matching(&mut receiver.events, "hello world", |event| {
                matches!(event, MeshEvent::Message { .. })
            })
            .await;
            let MeshEvent::Message {
                user_token,
                payload,
                latency,
            } = event
            else {
                unreachable!()
            };
            assert_eq!(user_token, "alpha");
            assert_eq!(payload, Payload::Text("hello world".into()));
            assert!(latency < Duration::from_secs(5));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        for receiver in [&mut bravo, &mut charlie] {
            let extra = drain(&mut receiver.events)
                .into_iter()
                .filter(|event| matches!(event, MeshEvent::Message { .. }))
                .count();
            assert_eq!(extra, 0, "exactly one delivery per transfer");
        }

        let value = json!({ "move": "e4", "clock": [300, 295] });
        bravo
            .channel
            .send_to("charlie", value.clone())
            .await
            .expect("send_to");
        let event = next_matching(&mut charlie.events, "object payload", |event| {
            matches!(event, MeshEvent::Message { user_token, .. } if user_token == "bravo")
        })
        .await;
        assert!(matches!(event, MeshEvent::Message { payload: Payload::Object(ref got), .. } if *got == value));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_broadcaster_succession_promotes_first_session() {
        let relay = Arc::new(LocalRelay::new());
        let network = LoopbackNetwork::new();
        let (alpha, bravo, charlie) =
            three_peer_mesh(&relay, |name| loopback(&relay, &network, name)).await;

        alpha.channel.leave().expect("leave");

        let promoted = status_until(&bravo.channel, "bravo promoted", |status| {
            status.is_broadcaster
        })
        .await;
        assert_eq!(promoted.room_token.as_deref(), Some("room-1"));
        eventually("alpha gone from survivors", || {
            peers(&bravo) == names(&["charlie"]) && peers(&charlie) == names(&["bravo"])
        })
        .await;
        let plain = charlie.channel.status().await.expect("status");
        assert!(!plain.is_broadcaster);
        assert!(peers(&alpha).is_empty());
        let left = alpha.channel.status().await.expect("status");
        assert!(!left.is_broadcaster && left.sessions.is_empty());

        // The new broadcaster keeps announcing, so a late joiner still finds the room.
        let delta = loopback(&relay, &network, "delta");
        delta.channel.connect().expect("connect");
        eventually("delta meshed with survivors", || {
            peers(&delta) == names(&["bravo", "charlie"])
        })
        .await;
        assert!(peers(&alpha).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_broadcaster_leave_can_close_entire_session() {
        let relay = Arc::new(LocalRelay::new());
        let network = LoopbackNetwork::new();
        let config = fast_config().with_auto_close_entire_session(true);
        let (alpha, mut bravo, charlie) = three_peer_mesh(&relay, |name| {
            participant(&relay, Arc::new(network.clone()), name, config.clone())
        })
        .await;

        alpha.channel.leave().expect("leave");

        for survivor in [&bravo, &charlie] {
            status_until(&survivor.channel, "room closed", |status| {
                status.sessions.is_empty() && !status.joined && !status.is_broadcaster
            })
            .await;
        }
        eventually("all links closed", || {
            peers(&bravo).is_empty() && peers(&charlie).is_empty()
        })
        .await;
        // Only the lobby is still open on the relay.
        eventually("sub-channels released", || relay.channel_count() == 1).await;
        next_matching(&mut bravo.events, "alpha departure", |event| {
            matches!(event, MeshEvent::Left { user_token } if user_token == "alpha")
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_eject_drops_only_the_target() {
        let relay = Arc::new(LocalRelay::new());
        let network = LoopbackNetwork::new();
        let (alpha, mut bravo, charlie) =
            three_peer_mesh(&relay, |name| loopback(&relay, &network, name)).await;

        alpha.channel.eject("bravo").expect("eject");

        next_matching(&mut bravo.events, "ejection notice", |event| {
            matches!(event, MeshEvent::Left { user_token } if user_token == "alpha")
        })
        .await;
        eventually("bravo ejected", || {
            peers(&alpha) == names(&["charlie"])
                && peers(&bravo) == names(&["charlie"])
                && peers(&charlie) == names(&["alpha", "bravo"])
        })
        .await;
        let status = alpha.channel.status().await.expect("status");
        assert!(status.is_broadcaster, "eject keeps the broadcaster role");
        assert!(!bravo.channel.status().await.expect("status").is_broadcaster);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_channel_leaves_room() {
        let relay = Arc::new(LocalRelay::new());
        let network = LoopbackNetwork::new();
        let alpha = loopback(&relay, &network, "alpha");
        alpha.channel.open(None).expect("open room");
        let mut bravo = loopback(&relay, &network, "bravo");
        bravo.channel.connect().expect("connect");
        eventually("pair linked", || peers(&bravo) == names(&["alpha"])).await;

        drop(alpha);

        next_matching(&mut bravo.events, "alpha left", |event| {
            matches!(event, MeshEvent::Left { user_token } if user_token == "alpha")
        })
        .await;
        let status = status_until(&bravo.channel, "bravo inherits the room", |status| {
            status.is_broadcaster
        })
        .await;
        assert!(status.sessions.is_empty());
        assert!(peers(&bravo).is_empty());
    }
}
