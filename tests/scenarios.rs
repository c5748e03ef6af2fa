//! End-to-end orchestrator scenarios against the simulated controller

use crossbeam::channel::{unbounded, Receiver};
use gonk_netd::*;
use nix::errno::Errno;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (Arc<SimulatedNetd>, NetworkUtils, Receiver<NetworkResultOptions>) {
    let netd = Arc::new(SimulatedNetd::new().with_interfaces(&["wlan0", "rmnet0", "rmnet1", "rndis0"]));
    let (tx, rx) = unbounded();
    let utils = NetworkUtils::new(Platform::from_backend(netd.clone()), NetworkConfig::default(), tx);
    (netd, utils, rx)
}

async fn execute(utils: &mut NetworkUtils, request: serde_json::Value) {
    utils.execute_command(NetworkParams::from_value(request).unwrap()).await;
}

async fn create(utils: &mut NetworkUtils, rx: &Receiver<NetworkResultOptions>, ifname: &str, network_type: NetworkType) {
    execute(utils, json!({ "id": 0, "cmd": "createNetwork", "ifname": ifname, "networkType": network_type.0 })).await;
    utils.run_until_idle().await;
    let result = rx.try_recv().unwrap();
    assert!(!result.error, "createNetwork {} failed: {:?}", ifname, result);
}

fn wifi_tethering(id: i64, enable: bool, external: &str) -> serde_json::Value {
    json!({
        "id": id, "cmd": "setWifiTethering", "enable": enable,
        "ifname": "wlan0", "internalIfname": "wlan0", "externalIfname": external,
        "ip": "192.168.43.1", "prefix": "24", "link": if enable { "up" } else { "down" },
        "wifiStartIp": "192.168.43.10", "wifiEndIp": "192.168.43.50",
    })
}

fn usb_tethering(id: i64, internal: &str, ip: &str) -> serde_json::Value {
    json!({
        "id": id, "cmd": "setUSBTethering", "enable": true,
        "ifname": internal, "internalIfname": internal, "externalIfname": "rmnet1",
        "ip": ip, "prefix": "24", "link": "up",
        "wifiStartIp": "192.168.43.10", "wifiEndIp": "192.168.43.50",
        "usbStartIp": "192.168.42.10", "usbEndIp": "192.168.42.50",
    })
}

#[test]
fn test_net_id_reference_counting() {
    let mut ids = NetIdManager::default();

    let wifi = ids.acquire("wlan0", NetworkType::WIFI).unwrap();
    let both = ids.acquire("wlan0", NetworkType::MOBILE).unwrap();
    assert_eq!(wifi.net_id, both.net_id);
    assert_eq!(both.types, NetworkType::WIFI.bit().unwrap() | NetworkType::MOBILE.bit().unwrap());

    let left = ids.release("wlan0", NetworkType::WIFI).unwrap();
    assert_eq!(left.types, NetworkType::MOBILE.bit().unwrap());
    assert_eq!(ids.lookup("wlan0").unwrap().net_id, wifi.net_id);

    let left = ids.release("wlan0", NetworkType::MOBILE).unwrap();
    assert_eq!(left.types, 0);
}

#[tokio::test]
async fn test_wifi_tethering_start_failure_rolls_back() {
    let (netd, mut utils, rx) = setup();
    create(&mut utils, &rx, "rmnet0", NetworkType::MOBILE).await;
    netd.fail_on("tether_start", Errno::EBUSY);
    netd.clear_calls();

    execute(&mut utils, wifi_tethering(7, true, "rmnet0")).await;
    utils.run_until_idle().await;

    let result = rx.try_recv().unwrap();
    assert_eq!(result.id, 7);
    assert!(!result.result);
    assert!(result.error);
    assert!(rx.try_recv().is_err(), "rollback must not post a second result");

    let ops = netd.ops();
    let failed = ops.iter().position(|op| op == "tether_start").unwrap();
    assert_eq!(
        &ops[..failed],
        &[
            "interface_get_cfg",
            "interface_set_cfg",
            "tether_interface_add",
            "network_add_interface",
            "network_add_route",
            "ipfwd_enable_forwarding",
            "tether_is_enabled",
        ]
    );
    assert_eq!(
        &ops[failed + 1..],
        &["tether_interface_list", "ipfwd_disable_forwarding", "tether_interface_list", "tether_stop"]
    );

    assert!(!netd.forwarding_enabled());
    assert!(!netd.is_tethering_started());

    let stats = utils.get_stats();
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.chains_failed, 1);
}

#[tokio::test]
async fn test_wifi_tethering_failure_releases_ipv6_slot() {
    let dir = tempfile::tempdir().unwrap();
    let netd = Arc::new(SimulatedNetd::new().with_interfaces(&["wlan0", "rmnet1"]));
    let (tx, rx) = unbounded();
    let config = NetworkConfig {
        radvd_conf_path: dir.path().join("radvd.conf"),
        ..Default::default()
    };
    let mut utils = NetworkUtils::new(Platform::from_backend(netd.clone()), config, tx);
    create(&mut utils, &rx, "rmnet1", NetworkType::MOBILE).await;
    netd.set_property("net.rmnet1.dns1", "10.0.0.53");
    netd.set_property("net.dns1", "2001:4860:4860::8888");
    netd.fail_on_call(&format!("network_add_route {} wlan0 2001:db8:1:2::/64", LOCAL_NET_ID), Errno::EEXIST);

    let mut request = wifi_tethering(30, true, "rmnet1");
    request["ipv6Ip"] = json!("2001:db8:1:2::1234");
    request["dnses"] = json!(["8.8.8.8"]);
    execute(&mut utils, request).await;
    utils.run_until_idle().await;

    let results: Vec<_> = rx.try_iter().collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, 30);
    assert!(!results[0].result);
    assert!(results[0].error);

    let calls = netd.calls();
    let started = calls.iter().position(|c| c == "set_property ctl.start radvd").unwrap();
    let stopped = calls.iter().position(|c| c == "set_property ctl.stop radvd").unwrap();
    assert!(started < stopped);
    assert_eq!(netd.get_property("init.svc.radvd").as_deref(), Some("stopped"));
    assert_eq!(utils.ipv6_tethering(), (&[][..], false));
    assert!(!netd.forwarding_enabled());
    assert!(!netd.is_tethering_started());
    assert_eq!(utils.get_stats().rollbacks, 1);
}

#[tokio::test]
async fn test_usb_tethering_chains_do_not_overlap() {
    let (netd, mut utils, rx) = setup();
    create(&mut utils, &rx, "rmnet1", NetworkType::MOBILE).await;
    netd.clear_calls();

    execute(&mut utils, usb_tethering(1, "rndis0", "192.168.42.129")).await;
    execute(&mut utils, usb_tethering(2, "wlan0", "192.168.44.1")).await;
    assert_eq!(utils.pending_chains(), 2);

    // Nothing of the second chain may run before the first one posts
    while rx.is_empty() {
        assert!(utils.advance().await);
    }
    assert!(netd.calls().iter().all(|call| !call.contains("wlan0")));
    assert_eq!(rx.try_recv().unwrap().id, 1);

    utils.run_until_idle().await;
    let second = rx.try_recv().unwrap();
    assert_eq!(second.id, 2);
    assert!(second.result);

    assert_eq!(netd.tethered_interfaces(), vec!["rndis0".to_string(), "wlan0".to_string()]);
    assert_eq!(netd.call_count("tether_start"), 1);
}

#[tokio::test]
async fn test_destroy_network_with_remaining_consumers() {
    let (netd, mut utils, rx) = setup();
    create(&mut utils, &rx, "rmnet0", NetworkType::MOBILE).await;
    create(&mut utils, &rx, "rmnet0", NetworkType::MOBILE_MMS).await;
    netd.clear_calls();

    execute(&mut utils, json!({ "id": 3, "cmd": "destroyNetwork", "ifname": "rmnet0", "networkType": 1 })).await;
    utils.run_until_idle().await;

    let result = rx.try_recv().unwrap();
    assert_eq!(result.result_code, Some(0));
    assert!(!result.error);
    assert!(netd.calls().is_empty());
    assert_eq!(
        utils.net_ids().lookup("rmnet0").unwrap().types,
        NetworkType::MOBILE_MMS.bit().unwrap()
    );
}

#[tokio::test]
async fn test_create_destroy_round_trip() {
    let (netd, mut utils, rx) = setup();
    create(&mut utils, &rx, "wlan0", NetworkType::WIFI).await;
    let net_id = utils.net_ids().lookup("wlan0").unwrap().net_id;

    execute(&mut utils, json!({ "id": 4, "cmd": "destroyNetwork", "ifname": "wlan0", "networkType": 0 })).await;
    utils.run_until_idle().await;

    let result = rx.try_recv().unwrap();
    assert!(result.ret);
    assert!(utils.net_ids().lookup("wlan0").is_none());
    assert!(!netd.has_network(net_id));
    assert!(!netd.has_resolver_cache(net_id));
    assert!(!netd.has_wakeup("wlan0"));

    execute(&mut utils, json!({ "id": 5, "cmd": "getNetId", "ifname": "wlan0" })).await;
    assert!(!rx.try_recv().unwrap().result);
}

#[tokio::test]
async fn test_disable_tethering_twice() {
    let (netd, mut utils, rx) = setup();
    create(&mut utils, &rx, "rmnet1", NetworkType::MOBILE).await;

    execute(&mut utils, wifi_tethering(10, true, "rmnet1")).await;
    utils.run_until_idle().await;
    assert!(rx.try_recv().unwrap().result);

    for id in [11, 12] {
        execute(&mut utils, wifi_tethering(id, false, "rmnet1")).await;
        utils.run_until_idle().await;

        let result = rx.try_recv().unwrap();
        assert_eq!(result.id, id);
        assert!(result.result, "disable #{} failed: {:?}", id, result);
        assert!(!result.error);
    }

    assert!(netd.tethered_interfaces().is_empty());
    assert!(netd.nat_forwards().is_empty());
    assert!(netd.interface_forwards().is_empty());
    assert!(!netd.forwarding_enabled());
    assert_eq!(netd.call_count("tether_start"), 1);
    assert_eq!(utils.get_stats().chains_failed, 0);
}

#[tokio::test]
async fn test_tethering_keeps_shared_state_for_other_interface() {
    let (netd, mut utils, rx) = setup();
    create(&mut utils, &rx, "rmnet1", NetworkType::MOBILE).await;

    execute(&mut utils, usb_tethering(20, "rndis0", "192.168.42.129")).await;
    execute(&mut utils, wifi_tethering(21, true, "rmnet1")).await;
    execute(&mut utils, wifi_tethering(22, false, "rmnet1")).await;
    utils.run_until_idle().await;

    let results: Vec<_> = rx.try_iter().collect();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.result));

    // USB is still tethered: forwarding and dnsmasq stay up
    assert_eq!(netd.tethered_interfaces(), vec!["rndis0".to_string()]);
    assert!(netd.forwarding_enabled());
    assert!(netd.is_tethering_started());
    assert_eq!(
        netd.nat_forwards(),
        vec![("rndis0".to_string(), "rmnet1".to_string())]
    );
}

#[test]
fn test_worker_interleaves_immediate_commands() {
    let netd = Arc::new(SimulatedNetd::new().with_interfaces(&["wlan0"]));
    netd.set_delay(Some(Duration::from_millis(20)));
    let worker = NetworkWorker::new(Platform::from_backend(netd.clone()), NetworkConfig::default()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    worker.start(Arc::new(move |result: &NetworkResultOptions| sink.lock().push(result.id)));

    worker
        .post_message(json!({ "id": 1, "cmd": "createNetwork", "ifname": "wlan0", "networkType": 0 }))
        .unwrap();
    worker.post_message(json!({ "id": 2, "cmd": "getInterfaces" })).unwrap();

    while seen.lock().len() < 2 {
        assert!(worker.dispatch_next(Duration::from_secs(5)));
    }
    assert_eq!(*seen.lock(), vec![2, 1]);
}

#[test]
fn test_worker_lookup_failure_is_immediate() {
    let netd = Arc::new(SimulatedNetd::new());
    let worker = NetworkWorker::new(Platform::from_backend(netd), NetworkConfig::default()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    worker.start(Arc::new(move |result: &NetworkResultOptions| sink.lock().push(result.clone())));

    worker
        .post_message(json!({ "id": 9, "cmd": "setDNS", "ifname": "rmnet7", "dnses": ["8.8.8.8"] }))
        .unwrap();
    assert!(worker.dispatch_next(Duration::from_secs(5)));

    let results = seen.lock();
    assert_eq!(results[0].id, 9);
    assert!(results[0].error);
    assert_eq!(results[0].result_code, Some(-1));
    assert_eq!(worker.get_stats().orchestrator.chains_queued, 0);
}
