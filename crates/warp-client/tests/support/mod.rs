#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use warp_client::{
    Address, ClientConfig, ClientObserver, DownlinkObserver, ListObserver, MapObserver, Uri, Value,
    ValueObserver, WarpClient,
};
use warp_codec::Envelope;
use warp_transport::{MemoryNetwork, MemoryPeer};

pub const HOST: &str = "ws://memory";

pub fn uri(text: &str) -> Uri {
    Uri::parse(text).expect("test uri should parse")
}

pub fn address(node: &str, lane: &str) -> Address {
    address_on(HOST, node, lane)
}

pub fn address_on(host: &str, node: &str, lane: &str) -> Address {
    Address::resolve(Some(host), node, lane).expect("test address should resolve")
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        reconnect_initial: Duration::from_millis(100),
        reconnect_max: Duration::from_secs(1),
        link_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(60),
        relink_delay: Duration::from_millis(100),
        ..ClientConfig::default()
    }
}

pub fn client(network: &MemoryNetwork, config: ClientConfig) -> WarpClient {
    WarpClient::new(config, Arc::new(network.clone()))
}

/// Plays the server side of a successful `sync`.
pub fn serve_sync(peer: &MemoryPeer, address: &Address, events: &[Value]) {
    let (node, lane) = (address.node().clone(), address.lane().clone());
    assert!(peer.push(&Envelope::linked(node.clone(), lane.clone())));
    for body in events {
        assert!(peer.push(&Envelope::event(node.clone(), lane.clone(), body.clone())));
    }
    assert!(peer.push(&Envelope::synced(node, lane)));
}

pub fn sync_envelope(address: &Address) -> Envelope {
    Envelope::sync(
        address.node().clone(),
        address.lane().clone(),
        0.0,
        0.0,
        Value::Null,
    )
}

pub fn link_envelope(address: &Address) -> Envelope {
    Envelope::link(
        address.node().clone(),
        address.lane().clone(),
        0.0,
        0.0,
        Value::Null,
    )
}

pub fn command_envelope(address: &Address, body: Value) -> Envelope {
    Envelope::command(address.node().clone(), address.lane().clone(), body)
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Records downlink callbacks as short strings.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn push(&self, call: String) {
        self.calls.lock().expect("recorder lock").push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("recorder lock").clone()
    }

    /// Drains recorded calls, leaving out raw `event(..)` entries.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.calls.lock().expect("recorder lock"))
            .into_iter()
            .filter(|call| !call.starts_with("event("))
            .collect()
    }
}

impl DownlinkObserver for Recorder {
    fn will_link(&self) {
        self.push("will_link".to_string());
    }

    fn did_link(&self) {
        self.push("did_link".to_string());
    }

    fn will_sync(&self) {
        self.push("will_sync".to_string());
    }

    fn did_sync(&self) {
        self.push("did_sync".to_string());
    }

    fn on_event(&self, body: &Value) {
        self.push(format!("event({body})"));
    }

    fn did_unlink(&self) {
        self.push("did_unlink".to_string());
    }

    fn did_connect(&self) {
        self.push("did_connect".to_string());
    }

    fn did_disconnect(&self) {
        self.push("did_disconnect".to_string());
    }

    fn did_fail(&self, error: &str) {
        self.push(format!("did_fail({error})"));
    }

    fn did_close(&self) {
        self.push("did_close".to_string());
    }
}

impl ValueObserver<String> for Recorder {
    fn will_set(&self, new_value: &String) {
        self.push(format!("will_set({new_value})"));
    }

    fn did_set(&self, new_value: &String, old_value: Option<&String>) {
        self.push(format!("did_set({new_value}, {old_value:?})"));
    }
}

impl ListObserver<String> for Recorder {
    fn did_update(&self, index: usize, new_value: &String, old_value: Option<&String>) {
        self.push(format!("list_update({index}, {new_value}, {old_value:?})"));
    }

    fn did_insert(&self, index: usize, value: &String) {
        self.push(format!("list_insert({index}, {value})"));
    }

    fn did_remove(&self, index: usize, old_value: &String) {
        self.push(format!("list_remove({index}, {old_value})"));
    }

    fn did_move(&self, from: usize, to: usize, value: &String) {
        self.push(format!("list_move({from}, {to}, {value})"));
    }

    fn did_clear(&self) {
        self.push("list_clear".to_string());
    }

    fn did_drop(&self, count: usize) {
        self.push(format!("list_drop({count})"));
    }

    fn did_take(&self, count: usize) {
        self.push(format!("list_take({count})"));
    }
}

impl MapObserver<String, i64> for Recorder {
    fn did_update(&self, key: &String, new_value: &i64, old_value: Option<&i64>) {
        self.push(format!("map_update({key}, {new_value}, {old_value:?})"));
    }

    fn did_remove(&self, key: &String, old_value: &i64) {
        self.push(format!("map_remove({key}, {old_value})"));
    }

    fn did_clear(&self) {
        self.push("map_clear".to_string());
    }

    fn did_drop(&self, count: usize) {
        self.push(format!("map_drop({count})"));
    }

    fn did_take(&self, count: usize) {
        self.push(format!("map_take({count})"));
    }
}

/// Records client-level callbacks.
#[derive(Default)]
pub struct SessionLog {
    calls: Mutex<Vec<String>>,
}

impl SessionLog {
    fn push(&self, call: String) {
        self.calls.lock().expect("session log lock").push(call);
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.calls.lock().expect("session log lock"))
    }
}

impl ClientObserver for SessionLog {
    fn did_connect(&self, host: &Uri) {
        self.push(format!("connect({host})"));
    }

    fn did_authenticate(&self, host: &Uri, body: &Value) {
        self.push(format!("authenticate({host}, {body})"));
    }

    fn did_deauthenticate(&self, host: &Uri, body: &Value) {
        self.push(format!("deauthenticate({host}, {body})"));
    }

    fn did_disconnect(&self, host: &Uri) {
        self.push(format!("disconnect({host})"));
    }

    fn did_fail(&self, host: &Uri, error: &str) {
        self.push(format!("fail({host}, {error})"));
    }
}
