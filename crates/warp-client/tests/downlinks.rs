mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use warp_client::{Address, ClientError, DownlinkKind, LinkOptions, LinkState};
use warp_codec::Envelope;
use warp_transport::MemoryNetwork;

use support::{
    address, client, command_envelope, link_envelope, serve_sync, sync_envelope, test_config, uri,
    Recorder, HOST,
};

#[test]
fn value_downlink_links_syncs_and_sets() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let downlink = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open value downlink");
    let recorder = Arc::new(Recorder::default());
    downlink.observe(Arc::clone(&recorder)).expect("observe");
    assert_eq!(downlink.get().expect("get"), None);

    client.tick();
    assert_eq!(recorder.take(), vec!["did_connect", "will_link", "will_sync"]);
    assert_eq!(peer.take_envelopes(), vec![sync_envelope(&light)]);
    assert_eq!(downlink.link_state(), Ok(LinkState::Linking));

    serve_sync(&peer, &light, &[json!("on")]);
    client.tick();
    assert_eq!(
        recorder.take(),
        vec!["did_link", "will_set(on)", "did_set(on, None)", "did_sync"]
    );
    assert!(downlink.is_synced());
    assert_eq!(downlink.get().expect("get"), Some("on".to_string()));

    downlink.set(&"off".to_string()).expect("set");
    assert_eq!(
        downlink.get().expect("get"),
        Some("off".to_string()),
        "set applies locally before the server echoes it"
    );
    assert_eq!(
        peer.take_envelopes(),
        vec![command_envelope(&light, json!("off"))]
    );
    client.tick();
    assert_eq!(
        recorder.take(),
        vec!["will_set(off)", "did_set(off, Some(\"on\"))"]
    );
}

#[test]
fn late_joiner_shares_the_link_and_gets_a_replay() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let first = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open first");
    client.tick();
    serve_sync(&peer, &light, &[json!("on")]);
    client.tick();
    peer.take_sent();

    let second = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open second");
    let recorder = Arc::new(Recorder::default());
    second.observe(Arc::clone(&recorder)).expect("observe");
    client.tick();

    assert!(peer.take_sent().is_empty(), "aliases never relink");
    assert_eq!(client.downlink_count(), 1);
    assert_eq!(client.handle_count(), 2);
    assert_eq!(
        recorder.take(),
        vec!["did_link", "will_set(on)", "did_set(on, None)", "did_sync"]
    );
    assert_eq!(second.get().expect("get"), first.get().expect("get"));
}

#[test]
fn last_handle_closing_unlinks_and_cached_state_survives() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let first = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open first");
    let second = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open second");
    client.tick();
    serve_sync(&peer, &light, &[json!("on")]);
    client.tick();
    peer.take_sent();

    drop(first);
    assert!(peer.take_sent().is_empty(), "one handle still holds the link");
    drop(second);
    assert_eq!(
        peer.take_envelopes(),
        vec![Envelope::unlink(light.node().clone(), light.lane().clone())]
    );
    assert_eq!(client.handle_count(), 0);
    assert_eq!(client.downlink_count(), 1, "keep_linked models stay cached");
    assert_eq!(client.link_state(&light), Some(LinkState::Unlinked));

    let reopened = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("reopen");
    let recorder = Arc::new(Recorder::default());
    reopened.observe(Arc::clone(&recorder)).expect("observe");
    assert_eq!(reopened.get().expect("get"), Some("on".to_string()));
    client.tick();
    assert_eq!(
        recorder.take(),
        vec!["will_set(on)", "did_set(on, None)", "will_link", "will_sync"]
    );
    assert_eq!(peer.take_envelopes(), vec![sync_envelope(&light)]);
}

#[test]
fn closed_handle_reports_did_close_and_rejects_use() {
    let network = MemoryNetwork::new();
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let downlink = client
        .open_value_downlink::<String>(light, LinkOptions::default())
        .expect("open");
    let recorder = Arc::new(Recorder::default());
    downlink.observe(Arc::clone(&recorder)).expect("observe");
    client.tick();
    recorder.take();

    downlink.close();
    downlink.close();
    assert!(downlink.is_closed());
    assert_eq!(downlink.get(), Err(ClientError::DownlinkClosed));
    assert_eq!(
        downlink.set(&"x".to_string()),
        Err(ClientError::DownlinkClosed)
    );
    assert!(!downlink.is_linked());

    client.tick();
    assert_eq!(recorder.take(), vec!["did_close"]);
}

#[test]
fn opening_a_lane_as_another_kind_fails() {
    let network = MemoryNetwork::new();
    let client = client(&network, test_config());
    let rooms = address("house", "rooms");

    let _map = client
        .open_map_downlink::<String, i64>(rooms.clone(), LinkOptions::default())
        .expect("open map");
    let err = client
        .open_value_downlink::<String>(rooms, LinkOptions::default())
        .err()
        .expect("second open should fail");
    assert_eq!(
        err,
        ClientError::KindMismatch {
            existing: DownlinkKind::Map,
            requested: DownlinkKind::Value,
        }
    );
    assert_eq!(client.handle_count(), 1);
}

#[test]
fn absolute_node_uri_supplies_the_host() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = Address::resolve(None, "ws://memory/house/kitchen", "light")
        .expect("absolute node should resolve");
    assert_eq!(light.node().as_str(), "/house/kitchen");

    let _downlink = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open");
    client.tick();
    assert_eq!(network.opened_hosts(), vec![HOST.to_string()]);
    assert_eq!(peer.take_envelopes(), vec![sync_envelope(&light)]);
}

#[test]
fn commands_wait_for_the_link_and_keep_their_order() {
    let network = MemoryNetwork::manual();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let downlink = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open");
    downlink.set(&"dim".to_string()).expect("set before connect");
    downlink.command(json!("blink")).expect("command before connect");
    assert_eq!(downlink.get().expect("get"), Some("dim".to_string()));

    assert!(peer.accept());
    client.tick();
    assert_eq!(peer.take_envelopes(), vec![sync_envelope(&light)]);

    serve_sync(&peer, &light, &[]);
    client.tick();
    assert_eq!(
        peer.take_envelopes(),
        vec![
            command_envelope(&light, json!("dim")),
            command_envelope(&light, json!("blink")),
        ]
    );
}

#[test]
fn client_and_handle_commands_share_one_order_per_lane() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let first = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open");
    let second = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open alias");
    client.tick();
    assert_eq!(peer.take_envelopes(), vec![sync_envelope(&light)]);

    first.command(json!("c1")).expect("handle command while linking");
    client
        .command(&light, json!("c2"))
        .expect("client command while linking");
    second.command(json!("c3")).expect("alias command while linking");
    client.tick();
    assert!(peer.take_envelopes().is_empty(), "commands wait for the link");

    serve_sync(&peer, &light, &[]);
    client.tick();
    client
        .command(&light, json!("c4"))
        .expect("client command once linked");
    assert_eq!(
        peer.take_envelopes(),
        vec![
            command_envelope(&light, json!("c1")),
            command_envelope(&light, json!("c2")),
            command_envelope(&light, json!("c3")),
            command_envelope(&light, json!("c4")),
        ]
    );
}

#[test]
fn commands_accepted_before_the_link_outlive_the_downlink() {
    let network = MemoryNetwork::manual();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let downlink = client
        .open_value_downlink::<String>(
            light.clone(),
            LinkOptions::default().with_keep_linked(false),
        )
        .expect("open");
    downlink.command(json!("blink")).expect("command before connect");
    downlink.close();
    assert_eq!(client.downlink_count(), 0);
    assert_eq!(client.pending_outbound(&uri(HOST)), 1);

    assert!(peer.accept());
    client.tick();
    assert_eq!(
        peer.take_envelopes(),
        vec![command_envelope(&light, json!("blink"))]
    );
}

#[test]
fn cached_models_do_not_replay_commands_on_reopen() {
    let network = MemoryNetwork::manual();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let downlink = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open");
    downlink.command(json!("dim")).expect("command before connect");
    drop(downlink);
    assert_eq!(client.downlink_count(), 1, "keep_linked caches the model");

    assert!(peer.accept());
    client.tick();
    assert_eq!(
        peer.take_envelopes(),
        vec![command_envelope(&light, json!("dim"))]
    );

    let _reopened = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("reopen");
    client.tick();
    assert_eq!(peer.take_envelopes(), vec![sync_envelope(&light)]);
}

#[test]
fn server_null_is_a_value_not_an_absence() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let optional = client
        .open_value_downlink::<Option<String>>(light.clone(), LinkOptions::default())
        .expect("open");
    client.tick();
    assert_eq!(optional.get().expect("get before sync"), None);

    serve_sync(&peer, &light, &[json!(null)]);
    client.tick();
    assert_eq!(optional.get().expect("get after null"), Some(None));

    let strict = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open alias");
    assert!(matches!(strict.get(), Err(ClientError::Coercion(_))));
}

#[test]
fn event_downlink_links_without_sync_and_upgrades_on_demand() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let feed = address("house", "doorbell");

    let events = client
        .open_event_downlink(feed.clone(), LinkOptions::event())
        .expect("open event downlink");
    let recorder = Arc::new(Recorder::default());
    events.observe(Arc::clone(&recorder)).expect("observe");
    client.tick();
    assert_eq!(peer.take_envelopes(), vec![link_envelope(&feed)]);

    assert!(peer.push(&Envelope::linked(feed.node().clone(), feed.lane().clone())));
    assert!(peer.push(&Envelope::event(
        feed.node().clone(),
        feed.lane().clone(),
        json!({"n": 1}),
    )));
    client.tick();
    assert!(recorder.calls().contains(&"event({\"n\":1})".to_string()));
    assert_eq!(events.link_state(), Ok(LinkState::Linked));

    let synced = client
        .open_event_downlink(feed.clone(), LinkOptions::default())
        .expect("open synced alias");
    assert_eq!(peer.take_envelopes(), vec![sync_envelope(&feed)]);
    assert_eq!(synced.link_state(), Ok(LinkState::Syncing));

    assert!(peer.push(&Envelope::synced(feed.node().clone(), feed.lane().clone())));
    client.tick();
    assert!(events.is_synced());
    assert!(synced.is_synced());
}

#[test]
fn list_downlink_applies_server_events_and_local_edits() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let items = address("house/kitchen", "shopping");

    let list = client
        .open_list_downlink::<String>(items.clone(), LinkOptions::default())
        .expect("open list downlink");
    let recorder = Arc::new(Recorder::default());
    list.observe(Arc::clone(&recorder)).expect("observe");
    client.tick();
    recorder.take();
    peer.take_sent();

    serve_sync(
        &peer,
        &items,
        &[
            json!({"insert": {"index": 0, "value": "a"}}),
            json!({"insert": {"index": 1, "value": "b"}}),
        ],
    );
    client.tick();
    assert_eq!(
        recorder.take(),
        vec!["did_link", "list_insert(0, a)", "list_insert(1, b)", "did_sync"]
    );
    assert_eq!(list.values().expect("values"), vec!["a", "b"]);

    list.push(&"c".to_string()).expect("push");
    assert_eq!(
        peer.take_envelopes(),
        vec![command_envelope(
            &items,
            json!({"insert": {"index": 2, "value": "c"}})
        )]
    );

    list.move_item(0, 2).expect("move");
    assert_eq!(list.remove(0).expect("remove"), "b");
    list.splice(0, 1, &["x".to_string(), "y".to_string()])
        .expect("splice");
    assert_eq!(list.values().expect("values"), vec!["x", "y", "a"]);

    assert_eq!(
        list.insert(9, &"z".to_string()),
        Err(ClientError::IndexOutOfBounds { index: 9, len: 3 })
    );
    assert!(list.splice(2, 5, &[]).is_err());
    assert_eq!(list.len().expect("len"), 3, "failed splice changes nothing");

    list.set(1, &"Y".to_string()).expect("set");
    assert_eq!(list.get(1).expect("get"), Some("Y".to_string()));
    assert_eq!(list.get(5).expect("get"), None);
    list.drop_front(1).expect("drop");
    list.take_front(1).expect("take");
    assert_eq!(list.values().expect("values"), vec!["Y"]);
    list.clear().expect("clear");
    assert!(list.is_empty().expect("is_empty"));

    client.tick();
    assert_eq!(
        recorder.take(),
        vec![
            "list_insert(2, c)",
            "list_move(0, 2, a)",
            "list_remove(0, b)",
            "list_remove(0, c)",
            "list_insert(0, x)",
            "list_insert(1, y)",
            "list_update(1, Y, Some(\"y\"))",
            "list_drop(1)",
            "list_take(1)",
            "list_clear",
        ]
    );
}

#[test]
fn two_map_downlinks_share_one_lane() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let rooms = address("house", "rooms");

    let first = client
        .open_map_downlink::<String, i64>(rooms.clone(), LinkOptions::default())
        .expect("open first map");
    let first_log = Arc::new(Recorder::default());
    first.observe(Arc::clone(&first_log)).expect("observe first");
    client.tick();
    first_log.take();

    let second = client
        .open_map_downlink::<String, i64>(rooms.clone(), LinkOptions::default())
        .expect("open second map");
    let second_log = Arc::new(Recorder::default());
    second.observe(Arc::clone(&second_log)).expect("observe second");
    assert_eq!(peer.take_envelopes(), vec![sync_envelope(&rooms)]);

    serve_sync(
        &peer,
        &rooms,
        &[
            json!({"update": {"key": "b", "value": 2}}),
            json!({"update": {"key": "a", "value": 1}}),
        ],
    );
    client.tick();
    let expected = vec![
        "did_link",
        "map_update(b, 2, None)",
        "map_update(a, 1, None)",
        "did_sync",
    ];
    assert_eq!(first_log.take(), expected);
    assert_eq!(second_log.take(), expected);

    assert_eq!(second.keys().expect("keys"), vec!["a", "b"]);
    assert_eq!(
        first.entries().expect("entries"),
        vec![("a".to_string(), 1), ("b".to_string(), 2)]
    );

    assert_eq!(first.set(&"a".to_string(), &5).expect("set"), Some(1));
    assert_eq!(second.get(&"a".to_string()).expect("get"), Some(5));
    assert_eq!(first.remove(&"zzz".to_string()).expect("remove"), None);
    assert_eq!(second.remove(&"b".to_string()).expect("remove"), Some(2));
    assert!(!first.contains_key(&"b".to_string()).expect("contains_key"));
    assert_eq!(
        peer.take_envelopes(),
        vec![
            command_envelope(&rooms, json!({"update": {"key": "a", "value": 5}})),
            command_envelope(&rooms, json!({"remove": {"key": "zzz"}})),
            command_envelope(&rooms, json!({"remove": {"key": "b"}})),
        ]
    );

    assert!(peer.push(&Envelope::event(
        rooms.node().clone(),
        rooms.lane().clone(),
        json!({"remove": {"key": "a"}}),
    )));
    client.tick();
    assert_eq!(
        first_log.take(),
        vec!["map_update(a, 5, Some(1))", "map_remove(b, 2)", "map_remove(a, 5)"]
    );
    assert!(second.is_empty().expect("is_empty"));

    for (key, value) in [("c", 3), ("d", 4), ("e", 5)] {
        first.set(&key.to_string(), &value).expect("set");
    }
    first.drop_front(1).expect("drop");
    first.take_front(1).expect("take");
    assert_eq!(second.keys().expect("keys"), vec!["d"]);
    assert_eq!(second.len().expect("len"), 1);
}

#[test]
fn server_unlink_relinks_after_delay() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let downlink = client
        .open_value_downlink::<String>(light.clone(), LinkOptions::default())
        .expect("open");
    let recorder = Arc::new(Recorder::default());
    downlink.observe(Arc::clone(&recorder)).expect("observe");
    let start = Instant::now();
    client.poll(start);
    serve_sync(&peer, &light, &[]);
    client.poll(start);
    peer.take_sent();
    recorder.take();

    assert!(peer.push(&Envelope::unlinked(
        light.node().clone(),
        light.lane().clone(),
        json!("restarting"),
    )));
    client.poll(start);
    assert_eq!(recorder.take(), vec!["did_unlink"]);
    assert_eq!(downlink.link_state(), Ok(LinkState::Unlinked));

    client.poll(start + Duration::from_millis(50));
    assert!(peer.take_sent().is_empty(), "relink waits for the delay");

    client.poll(start + Duration::from_millis(150));
    assert_eq!(peer.take_envelopes(), vec![sync_envelope(&light)]);
    assert_eq!(recorder.take(), vec!["will_link", "will_sync"]);
}

#[test]
fn unlink_closes_downlinks_that_do_not_keep_the_link() {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = client(&network, test_config());
    let light = address("house/kitchen", "light");

    let downlink = client
        .open_value_downlink::<String>(
            light.clone(),
            LinkOptions::default().with_keep_linked(false),
        )
        .expect("open");
    let recorder = Arc::new(Recorder::default());
    downlink.observe(Arc::clone(&recorder)).expect("observe");
    client.tick();
    serve_sync(&peer, &light, &[]);
    client.tick();
    recorder.take();

    assert!(peer.push(&Envelope::unlinked(
        light.node().clone(),
        light.lane().clone(),
        json!(null),
    )));
    client.tick();
    assert_eq!(recorder.take(), vec!["did_unlink", "did_close"]);
    assert!(downlink.is_closed());
    assert_eq!(client.downlink_count(), 0);
    assert_eq!(client.handle_count(), 0);
}
