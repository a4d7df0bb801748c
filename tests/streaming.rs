//! End-to-end streaming scenarios against a scripted in-memory firmware:
//! boot handshake, full job runs, error handling and shutdown.

mod common;

use common::{collector, ok_firmware, spawn_firmware, wait_for, EventLog};
use grbl_stream::machines::grbl::{Event, GrblMachine};

/// Waits until the boot handshake — banner plus the `$$` settings exchange
/// the engine requests on boot — has fully drained, so its trailing `ok`
/// cannot interleave with job acknowledgments.
async fn settle_boot(events: &EventLog) {
    assert!(wait_for(events, |e| matches!(e, Event::Boot)).await);
    // the construction-time defaults lack $132; only the firmware's own
    // dump carries it
    assert!(
        wait_for(events, |e| matches!(
            e,
            Event::SettingsDownloaded { settings } if settings.contains_key(&132)
        ))
        .await
    );
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_boot_handshake() {
    let (callback, events) = collector();
    let mut machine = GrblMachine::new("itest", callback);
    let (reader, writer) = spawn_firmware(ok_firmware());
    machine.connect_transport(reader, writer).await.unwrap();

    assert!(wait_for(&events, |e| matches!(e, Event::Boot)).await);
    assert!(machine.is_connected().await);

    machine.disconnect().await;
    assert!(wait_for(&events, |e| matches!(e, Event::Disconnected)).await);
    assert!(!machine.is_connected().await);
}

#[tokio::test]
async fn test_stream_job_to_completion() {
    let (callback, events) = collector();
    let mut machine = GrblMachine::new("itest", callback);
    let (reader, writer) = spawn_firmware(ok_firmware());
    machine.connect_transport(reader, writer).await.unwrap();
    settle_boot(&events).await;

    machine.stream("G0 X1\nG0 X2\nG0 X3").await;
    assert!(wait_for(&events, |e| matches!(e, Event::JobCompleted)).await);

    let events = events.lock().unwrap();
    let processed: Vec<(usize, String)> = events
        .iter()
        .filter_map(|e| match e {
            Event::ProcessedCommand { line_nr, line } => Some((*line_nr, line.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        processed,
        vec![
            (0, "G0X1".to_string()),
            (1, "G0X2".to_string()),
            (2, "G0X3".to_string()),
        ]
    );

    // every send precedes its acknowledgment
    for nr in 0..3usize {
        let sent = events
            .iter()
            .position(|e| matches!(e, Event::LineSent { line_nr, .. } if *line_nr == nr));
        let acked = events
            .iter()
            .position(|e| matches!(e, Event::ProcessedCommand { line_nr, .. } if *line_nr == nr));
        assert!(sent.unwrap() < acked.unwrap(), "line {}", nr);
    }
}

#[tokio::test]
async fn test_firmware_error_reports_offending_line() {
    let (callback, events) = collector();
    let mut machine = GrblMachine::new("itest", callback);
    let (reader, writer) = spawn_firmware(Box::new(|line: &str| {
        if line.contains("BAD") {
            vec!["error:20".to_string()]
        } else {
            vec!["ok".to_string()]
        }
    }));
    machine.connect_transport(reader, writer).await.unwrap();
    settle_boot(&events).await;

    machine.stream("G0 X1\nXBAD\nG0 X2").await;
    assert!(wait_for(&events, |e| matches!(e, Event::Error { .. })).await);

    {
        let events = events.lock().unwrap();
        match events.iter().find(|e| matches!(e, Event::Error { .. })) {
            Some(Event::Error { line, line_nr, raw }) => {
                assert_eq!(line, "XBAD");
                assert_eq!(*line_nr, Some(1));
                assert_eq!(raw, "error:20");
            }
            _ => unreachable!(),
        }
    }

    // the window drains and the job ends (with the error recorded)
    assert!(wait_for(&events, |e| matches!(e, Event::JobCompleted)).await);

    // recovery: a fresh job streams normally
    machine.job_new().await;
    machine.stream("G0 X5").await;
    let completions_before = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, Event::JobCompleted))
        .count();
    assert!(completions_before >= 1);
    assert!(
        wait_for(&events, |e| matches!(
            e,
            Event::ProcessedCommand { line, .. } if line == "G0X5"
        ))
        .await
    );

    machine.disconnect().await;
}

#[tokio::test]
async fn test_poller_reports_state() {
    let (callback, events) = collector();
    let mut machine = GrblMachine::new("itest", callback);
    machine.set_poll_interval(std::time::Duration::from_millis(20));
    let (reader, writer) = spawn_firmware(ok_firmware());
    machine.connect_transport(reader, writer).await.unwrap();
    settle_boot(&events).await;

    machine.poll_start().await;
    assert!(wait_for(&events, |e| matches!(e, Event::StateUpdate { .. })).await);
    machine.poll_stop().await;
    machine.disconnect().await;
}

#[tokio::test]
async fn test_rx_buffer_stays_bounded_on_large_job() {
    let (callback, events) = collector();
    let mut machine = GrblMachine::new("itest", callback);
    let (reader, writer) = spawn_firmware(ok_firmware());
    machine.connect_transport(reader, writer).await.unwrap();
    settle_boot(&events).await;

    // 60 short rapid moves; far more than one 128-byte window holds
    let job: Vec<String> = (0..60).map(|i| format!("G0 X{}", i)).collect();
    machine.stream(&job.join("\n")).await;
    assert!(wait_for(&events, |e| matches!(e, Event::JobCompleted)).await);

    let events = events.lock().unwrap();
    for event in events.iter() {
        if let Event::RxBufferPercent { percent } = event {
            assert!(*percent <= 100);
        }
    }
    let processed = events
        .iter()
        .filter(|e| matches!(e, Event::ProcessedCommand { .. }))
        .count();
    assert_eq!(processed, 60);
}
