use senseme::{
    callback, get_device_by_ip_address, CallbackError, Device, DeviceEvent, Direction,
    SensemeError, SessionConfig, SessionState,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const SNAPSHOT: &str = "(Fan;FAN;PWR;ON)(Fan;FAN;SPD;ACTUAL;3)(Fan;FAN;SPD;MAX;7)\
(Fan;FAN;BOOKENDS;1;7)(Fan;FAN;DIR;FWD)(Fan;FW;NAME;FW000003)(Fan;FW;FW000003;2.6.0)\
(Fan;DEVICE;LIGHT;PRESENT)(Fan;GROUP;LIST;Bedroom)(Fan;GROUP;ROOM;TYPE;3)\
(Fan;TIME;VALUE;2020-01-01T00:00:00)(Fan;SNSROCC;TIMEOUT;MIN;60000)";

type Replies = Vec<(&'static str, &'static str)>;

/// Answer every request chunk containing a needle with its reply
async fn serve(mut socket: TcpStream, replies: Arc<Replies>, requests: mpsc::UnboundedSender<String>) {
    let mut buffer = [0u8; 1024];
    loop {
        let n = match socket.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let request = String::from_utf8_lossy(&buffer[..n]).to_string();
        let _ = requests.send(request.clone());
        for (needle, reply) in replies.iter() {
            if request.contains(needle) && socket.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Mock device accepting any number of connections
async fn mock_device(replies: Replies) -> (u16, mpsc::UnboundedReceiver<String>, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    let accepts = Arc::new(AtomicUsize::new(0));
    let replies = Arc::new(replies);

    let counter = accepts.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(socket, replies.clone(), tx.clone()));
        }
    });
    (port, rx, accepts)
}

fn config(port: u16) -> SessionConfig {
    SessionConfig::default()
        .with_port(port)
        .with_reconnect_delay(Duration::from_millis(100))
        .with_disconnect_pause(Duration::from_millis(100))
        .with_error_pause(Duration::from_millis(100))
        .with_update_timeout(Duration::from_secs(2))
        .with_query_timeout(Duration::from_secs(2))
}

fn fan(port: u16) -> Device {
    Device::new(
        "Fan",
        "AA:BB:CC:DD:EE:FF",
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        "FAN,HAIKU,SENSEME",
        config(port),
    )
}

fn event_log(device: &Device) -> mpsc::UnboundedReceiver<DeviceEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    device.add_callback(callback(move |event: DeviceEvent| {
        let tx = tx.clone();
        async move {
            tx.send(event)?;
            Ok::<(), CallbackError>(())
        }
    }));
    rx
}

/// Wait until the concatenated requests contain `needle`
async fn expect_request(requests: &mut mpsc::UnboundedReceiver<String>, needle: &str) {
    let mut seen = String::new();
    let found = timeout(Duration::from_secs(2), async {
        while let Some(request) = requests.recv().await {
            seen.push_str(&request);
            if seen.contains(needle) {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "never received {needle}");
}

/// First `count` connectivity events, in delivery order
async fn connectivity(
    events: &mut mpsc::UnboundedReceiver<DeviceEvent>,
    count: usize,
    limit: Duration,
) -> Vec<DeviceEvent> {
    let mut seen = Vec::new();
    let _ = timeout(limit, async {
        while let Some(event) = events.recv().await {
            if !matches!(event, DeviceEvent::Changed { .. }) {
                seen.push(event);
            }
            if seen.len() == count {
                break;
            }
        }
    })
    .await;
    seen
}

/// Device that closes every connection after answering with `reply`
async fn flaky_device(reply: &'static [u8]) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            // wait for the full status request so nothing is left unread
            let mut seen = Vec::new();
            let mut buffer = [0u8; 256];
            while !String::from_utf8_lossy(&seen).contains("SNSROCC;STATUS;GET") {
                match socket.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => seen.extend_from_slice(&buffer[..n]),
                }
            }
            if !reply.is_empty() {
                let _ = socket.write_all(reply).await;
            }
            drop(socket);
        }
    });
    (port, accepts)
}

fn fast_retry(port: u16, max_errors: u32) -> Device {
    let config = config(port)
        .with_reconnect_delay(Duration::from_millis(20))
        .with_disconnect_pause(Duration::from_millis(20))
        .with_error_pause(Duration::from_millis(20))
        .with_max_errors(max_errors);
    Device::new(
        "Fan",
        "AA:BB:CC:DD:EE:FF",
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        "FAN,HAIKU,SENSEME",
        config,
    )
}

#[tokio::test]
async fn test_session_mirrors_full_snapshot() {
    let (port, mut requests, _) = mock_device(vec![("GETALL", SNAPSHOT)]).await;
    let device = fan(port);

    assert!(device.update().await);
    assert!(device.connected());
    assert!(device.first_update_complete());
    expect_request(&mut requests, "<Fan;SNSROCC;STATUS;GET>").await;

    let fan = device.as_fan().unwrap();
    assert_eq!(fan.on(), Some(true));
    assert_eq!(fan.speed(), Some(3));
    assert_eq!(fan.speed_limits_room(), Some((1, 7)));
    assert_eq!(fan.direction(), Some(Direction::Forward));
    assert_eq!(device.fw_version().as_deref(), Some("2.6.0"));
    assert_eq!(device.has_light(), Some(true));
    assert_eq!(device.room_name().as_deref(), Some("Bedroom"));
    assert_eq!(device.room_type(), Some("Bedroom"));
    assert_eq!(device.get("TIME;VALUE"), None);

    device.stop();
}

#[tokio::test]
async fn test_setters_write_commands() {
    let (port, mut requests, _) = mock_device(vec![("GETALL", SNAPSHOT)]).await;
    let device = fan(port);
    assert!(device.update().await);

    let fan = device.as_fan().unwrap();
    fan.set_speed(9).unwrap();
    expect_request(&mut requests, "<Fan;FAN;SPD;SET;7>").await;
    device.set_light_on(false).unwrap();
    expect_request(&mut requests, "<Fan;LIGHT;PWR;OFF>").await;

    device.stop();
    assert!(matches!(fan.set_on(false), Err(SensemeError::NotConnected)));
}

#[tokio::test]
async fn test_update_times_out_without_full_snapshot() {
    let (port, _requests, _) = mock_device(vec![("GETALL", "(Fan;FAN;PWR;OFF)")]).await;
    let device = fan(port);

    assert!(!device.update_within(Duration::from_millis(300)).await);
    assert!(device.connected());
    assert_eq!(device.as_fan().unwrap().on(), Some(false));
    device.stop();
}

#[tokio::test]
async fn test_malformed_record_does_not_block_batch() {
    let batch = "(Fan;FAN;PWR;ON)(garbage)(Fan;FAN;SPD;ACTUAL;4)(Fan;SNSROCC;TIMEOUT;MIN;1)";
    let (port, _requests, _) = mock_device(vec![("GETALL", batch)]).await;
    let device = fan(port);

    assert!(device.update().await);
    let fan = device.as_fan().unwrap();
    assert_eq!(fan.on(), Some(true));
    assert_eq!(fan.speed(), Some(4));
    device.stop();
}

#[tokio::test]
async fn test_reconnects_after_peer_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        // first connection is closed right after the snapshot
        let (mut first, _) = listener.accept().await.unwrap();
        counter.fetch_add(1, Ordering::SeqCst);
        let mut buffer = [0u8; 256];
        let _ = first.read(&mut buffer).await;
        first.write_all(b"(Fan;FAN;PWR;ON)").await.unwrap();
        drop(first);

        let (_second, _) = listener.accept().await.unwrap();
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let device = fan(port);
    let mut events = event_log(&device);
    device.start();

    let seen = connectivity(&mut events, 3, Duration::from_secs(3)).await;
    assert_eq!(
        seen,
        vec![DeviceEvent::Connected, DeviceEvent::Disconnected, DeviceEvent::Connected]
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
    assert!(device.connected());
    device.stop();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (port, _requests, _) = mock_device(vec![("GETALL", SNAPSHOT)]).await;
    let device = fan(port);
    let mut events = event_log(&device);

    assert!(device.update().await);
    assert!(device.is_running());
    device.stop();
    device.stop();

    assert!(!device.is_running());
    assert!(!device.connected());
    assert_eq!(device.session_state(), SessionState::Stopped);

    let mut saw_disconnect = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(500), events.recv()).await {
        if event == DeviceEvent::Disconnected {
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);

    // a stopped device can be started again
    assert!(device.update().await);
    device.start();
    assert!(device.is_running());
    device.stop();
}

#[tokio::test]
async fn test_repeated_values_notify_once() {
    let batch = "(Fan;FAN;PWR;ON)(Fan;TIME;VALUE;1)(Fan;FAN;PWR;ON)(Fan;TIME;VALUE;2)\
(Fan;SNSROCC;TIMEOUT;MIN;1)";
    let (port, _requests, _) = mock_device(vec![("GETALL", batch)]).await;
    let device = fan(port);
    let mut events = event_log(&device);
    assert!(device.update().await);

    let mut changes = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(300), events.recv()).await {
        if let DeviceEvent::Changed { key, .. } = event {
            changes.push(key);
        }
    }
    changes.sort();
    assert_eq!(changes, vec!["FAN;PWR".to_string(), "SNSROCC;TIMEOUT;MIN".to_string()]);
    device.stop();
}

#[tokio::test]
async fn test_lookup_by_ip_address() {
    let (port, _requests, _) = mock_device(vec![
        ("DEVICE;ID", "(Porch Light;DEVICE;ID;20:F8:5E:00:00:09;LIGHT,HAIKU)"),
        ("FW;NAME", "(Porch Light;FW;NAME;FW000007)"),
        ("FW;FW000007", "(Porch Light;FW;FW000007;3.1.0)"),
        ("DEVICE;LIGHT", "(Porch Light;DEVICE;LIGHT;PRESENT;COLOR)"),
        ("GROUP;LIST", "(Porch Light;GROUP;LIST;EMPTY)"),
        ("GROUP;ROOM;TYPE", "(Porch Light;GROUP;ROOM;TYPE;0)"),
    ])
    .await;

    let device = get_device_by_ip_address("127.0.0.1", config(port))
        .await
        .unwrap();
    assert_eq!(device.name(), "Porch Light");
    assert_eq!(device.id(), "20:F8:5E:00:00:09");
    assert!(device.is_light());
    assert_eq!(device.model(), "Haiku Light");
    assert_eq!(device.fw_version().as_deref(), Some("3.1.0"));
    assert_eq!(device.room_status(), Some(false));
    assert!(!device.is_running());
}

#[tokio::test]
async fn test_session_gives_up_on_device_that_never_answers() {
    let (port, accepts) = flaky_device(b"").await;
    let device = fast_retry(port, 2);
    let mut events = event_log(&device);
    device.start();

    let stopped = timeout(Duration::from_secs(3), async {
        while device.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        stopped.is_ok(),
        "session still running after {} connections",
        accepts.load(Ordering::SeqCst)
    );

    assert_eq!(device.session_state(), SessionState::Stopped);
    assert_eq!(device.error_count(), 3);
    assert!(!device.connected());
    assert_eq!(accepts.load(Ordering::SeqCst), 3);

    let seen = connectivity(&mut events, 6, Duration::from_secs(1)).await;
    let cycle = [DeviceEvent::Connected, DeviceEvent::Disconnected];
    let expected: Vec<DeviceEvent> = cycle.iter().cycle().take(6).cloned().collect();
    assert_eq!(seen, expected);

    // only an explicit start brings it back
    device.start();
    assert!(device.is_running());
    assert_eq!(device.error_count(), 0);
    device.stop();
}

#[tokio::test]
async fn test_answering_device_resets_error_count() {
    let (port, accepts) = flaky_device(b"(Fan;FAN;PWR;ON)").await;
    let device = fast_retry(port, 0);
    device.start();

    let reconnected = timeout(Duration::from_secs(3), async {
        while accepts.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reconnected.is_ok());
    assert!(device.is_running());
    assert_ne!(device.session_state(), SessionState::Stopped);
    device.stop();
}
