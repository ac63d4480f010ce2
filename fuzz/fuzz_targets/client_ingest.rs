#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use warp_client::{Address, LinkOptions, WarpClient};
use warp_codec::Envelope;
use warp_transport::MemoryNetwork;

const HOST: &str = "ws://fuzz";

fuzz_target!(|data: &[u8]| {
    let network = MemoryNetwork::new();
    let peer = network.peer(HOST);
    let client = WarpClient::with_factory(network.clone());

    let Ok(items) = Address::resolve(Some(HOST), "/house", "items") else {
        return;
    };
    let Ok(rooms) = Address::resolve(Some(HOST), "/house", "rooms") else {
        return;
    };
    let Ok(_list) = client.open_list_downlink::<Value>(items.clone(), LinkOptions::default())
    else {
        return;
    };
    let Ok(_map) = client.open_map_downlink::<Value, Value>(rooms.clone(), LinkOptions::default())
    else {
        return;
    };
    client.tick();
    for address in [&items, &rooms] {
        peer.push(&Envelope::linked(address.node().clone(), address.lane().clone()));
        peer.push(&Envelope::synced(address.node().clone(), address.lane().clone()));
    }

    for chunk in data.split(|byte| *byte == b'\n') {
        peer.push_frame(String::from_utf8_lossy(chunk).into_owned());
        client.tick();
    }
    client.close();
});
