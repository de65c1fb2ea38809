use anyhow::Result;
use gridflow::net::frame::{decode_payload, encode_frame, PackageType, UnitType};
use gridflow::net::{RouterServer, UnitClient};
use gridflow::testing::wait_until;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn server() -> Arc<RouterServer> {
    // Port 0 lets the OS pick a free port.
    let server = Arc::new(RouterServer::bind(0).expect("bind"));
    server.start();
    server
}

fn unit(server: &RouterServer, unit_type: UnitType, name: &str) -> Arc<UnitClient> {
    let client = Arc::new(
        UnitClient::connect("127.0.0.1", server.local_port(), unit_type, name).expect("connect"),
    );
    client.start().expect("start");
    client
}

/// Attach a recorder for text frames received by a client.
fn record_texts(client: &UnitClient) -> Arc<Mutex<Vec<String>>> {
    let texts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&texts);
    client.add_callback(
        PackageType::Text,
        Arc::new(move |_, payload| {
            if let Ok(text) = decode_payload::<String>(payload) {
                recorder.lock().push(text);
            }
        }),
    );
    texts
}

#[test]
fn handshake_registers_typed_clients() -> Result<()> {
    let server = server();
    let _cu = unit(&server, UnitType::ComputeUnit, "cu-1");
    let _planner = unit(&server, UnitType::QueryPlanner, "planner-1");

    assert!(wait_until(WAIT, || server.client_count() == 2));
    let units = server.uuids_for_type(UnitType::ComputeUnit);
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].0, "cu-1");
    assert!(server.uuids_for_type(UnitType::Monitor).is_empty());
    Ok(())
}

#[test]
fn targeted_send_reaches_exactly_one_client() -> Result<()> {
    let server = server();
    let cu1 = unit(&server, UnitType::ComputeUnit, "cu-1");
    let cu2 = unit(&server, UnitType::ComputeUnit, "cu-2");
    let texts1 = record_texts(&cu1);
    let texts2 = record_texts(&cu2);
    assert!(wait_until(WAIT, || server.client_count() == 2));

    let target = cu1.uuid();
    let frame = encode_frame(PackageType::Text, 0, target, &"direct".to_string())?;
    let client = server.get_client(target).expect("registered");
    assert!(server.send_to(&client, &frame));

    assert!(wait_until(WAIT, || texts1.lock().as_slice() == ["direct"]));
    assert!(texts2.lock().is_empty());
    Ok(())
}

#[test]
fn broadcast_reaches_every_client_of_the_type() -> Result<()> {
    let server = server();
    let cu1 = unit(&server, UnitType::ComputeUnit, "cu-1");
    let cu2 = unit(&server, UnitType::ComputeUnit, "cu-2");
    let planner = unit(&server, UnitType::QueryPlanner, "planner");
    let texts1 = record_texts(&cu1);
    let texts2 = record_texts(&cu2);
    let planner_texts = record_texts(&planner);
    assert!(wait_until(WAIT, || server.client_count() == 3));

    let frame = encode_frame(PackageType::Text, 0, 0, &"fanout".to_string())?;
    server.send_to_all_of_type(UnitType::ComputeUnit, &frame);

    assert!(wait_until(WAIT, || {
        texts1.lock().len() == 1 && texts2.lock().len() == 1
    }));
    assert!(planner_texts.lock().is_empty());
    Ok(())
}

#[test]
fn reroute_never_returns_to_the_original_unit() -> Result<()> {
    let server = server();
    let draining = unit(&server, UnitType::ComputeUnit, "draining");
    let other = unit(&server, UnitType::ComputeUnit, "other");
    let drained_texts = record_texts(&draining);
    let other_texts = record_texts(&other);
    assert!(wait_until(WAIT, || server.client_count() == 2));

    // With only one other unit, every reroute lands there.
    let frame = encode_frame(PackageType::Text, 0, 0, &"rerouted".to_string())?;
    for _ in 0..3 {
        assert!(server.reroute_to_any_of_type(
            UnitType::ComputeUnit,
            Some(draining.uuid()),
            &frame
        ));
    }

    assert!(wait_until(WAIT, || other_texts.lock().len() == 3));
    assert!(drained_texts.lock().is_empty());
    Ok(())
}

#[test]
fn reroute_with_no_eligible_unit_fails() -> Result<()> {
    let server = server();
    let only = unit(&server, UnitType::ComputeUnit, "only");
    assert!(wait_until(WAIT, || server.client_count() == 1));

    let frame = encode_frame(PackageType::Text, 0, 0, &"nowhere".to_string())?;
    assert!(!server.reroute_to_any_of_type(
        UnitType::ComputeUnit,
        Some(only.uuid()),
        &frame
    ));
    Ok(())
}

#[test]
fn disconnect_is_observed_and_client_removed() -> Result<()> {
    let server = server();
    let cu = unit(&server, UnitType::ComputeUnit, "cu");
    assert!(wait_until(WAIT, || server.client_count() == 1));
    let uuid = cu.uuid();

    cu.shutdown();
    assert!(wait_until(WAIT, || {
        server
            .get_client(uuid)
            .map(|c| c.abort.load(std::sync::atomic::Ordering::Acquire))
            .unwrap_or(true)
    }));
    server.clear_aborted();
    assert!(server.get_client(uuid).is_none());
    Ok(())
}

#[test]
fn unit_messages_reach_the_router_callbacks() -> Result<()> {
    let server = server();
    let received: Arc<Mutex<Vec<(u64, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&received);
    server.add_callback(
        PackageType::Text,
        Arc::new(move |header, payload| {
            if let Ok(text) = decode_payload::<String>(payload) {
                recorder.lock().push((header.src_uuid, text));
            }
        }),
    );

    let cu = unit(&server, UnitType::ComputeUnit, "cu");
    assert!(wait_until(WAIT, || server.client_count() == 1));

    cu.text_response("hello router", 0)?;
    assert!(wait_until(WAIT, || received.lock().len() == 1));
    let (src, text) = received.lock()[0].clone();
    assert_eq!(src, cu.uuid());
    assert_eq!(text, "hello router");
    Ok(())
}
