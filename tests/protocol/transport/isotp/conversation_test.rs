//! End-to-end tests through the application handle: two stacks, each with its
//! own scheduler and runner, joined by an in-memory bus.
//!
//! Time is paused, so every timeout is checked against tokio's virtual clock.

mod helpers {
    include!("../../../helpers/mod.rs");
}

use embassy_time::Duration;
use helpers::{frame, sid, EchoCanBus, MockCanBus, TokioTimer};
use korri_isotp::error::{CodecError, IsoTpError, TimeoutKind};
use korri_isotp::protocol::transport::can_id::CanId;
use korri_isotp::protocol::transport::isotp::{
    conversation::{ConversationCell, Datagram},
    endpoint::Endpoint,
    facade::Conversation,
    options::Options,
    scheduler::Scheduler,
};
use korri_isotp::protocol::transport::traits::can_bus::CanBus;
use static_cell::StaticCell;

fn tester() -> Endpoint {
    Endpoint::normal(sid(0x700), sid(0x701))
}

fn ecu() -> Endpoint {
    Endpoint::normal(sid(0x701), sid(0x700))
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Send `data` from `local` to `peer` and return what the peer received.
async fn round_trip(
    local: Endpoint,
    peer: Endpoint,
    options: Options,
    data: &[u8],
) -> Result<Datagram, IsoTpError> {
    let (bus_a, bus_b) = MockCanBus::create_pair();
    let timer = TokioTimer::new();
    let cell_a = ConversationCell::new(local, options).unwrap();
    let cell_b = ConversationCell::new(peer, options).unwrap();
    let scheduler_a = Scheduler::new();
    let scheduler_b = Scheduler::new();
    let a = Conversation::new(&scheduler_a, &cell_a).unwrap();
    let b = Conversation::new(&scheduler_b, &cell_b).unwrap();
    let mut runner_a = scheduler_a.runner(bus_a, timer.clone());
    let mut runner_b = scheduler_b.runner(bus_b, timer);

    tokio::select! {
        (sent, received) = async { tokio::join!(a.send(data), b.recv()) } => {
            sent?;
            received
        }
        result = runner_a.run() => panic!("runner A stopped: {result:?}"),
        result = runner_b.run() => panic!("runner B stopped: {result:?}"),
    }
}

//==================================================================================
// TRANSFERS
//==================================================================================

#[tokio::test(start_paused = true)]
/// 20 bytes on 0x700/0x701: FF, CTS from the peer, then two CFs.
async fn test_twenty_bytes_on_the_wire() {
    let (bus_a, bus_b) = MockCanBus::create_pair();
    let wire = bus_a.wire();
    let timer = TokioTimer::new();
    let cell_a = ConversationCell::new(tester(), Options::default()).unwrap();
    let cell_b = ConversationCell::new(ecu(), Options::default()).unwrap();
    let scheduler_a = Scheduler::new();
    let scheduler_b = Scheduler::new();
    let a = Conversation::new(&scheduler_a, &cell_a).unwrap();
    let b = Conversation::new(&scheduler_b, &cell_b).unwrap();
    let mut runner_a = scheduler_a.runner(bus_a, timer.clone());
    let mut runner_b = scheduler_b.runner(bus_b, timer);

    let data = payload(20);
    tokio::select! {
        (sent, received) = async { tokio::join!(a.send(&data), b.recv()) } => {
            assert_eq!(sent, Ok(()));
            assert_eq!(received.unwrap().payload, data);
        }
        _ = runner_a.run() => panic!("runner A stopped"),
        _ = runner_b.run() => panic!("runner B stopped"),
    }

    let frames = wire.lock().unwrap().clone();
    assert_eq!(frames.len(), 4, "FF + FC + 2 CF expected");
    assert_eq!(frames[0].id, sid(0x700));
    assert_eq!(frames[0].payload(), &[0x10, 0x14, 0, 1, 2, 3, 4, 5]);
    assert_eq!(frames[1].id, sid(0x701));
    assert_eq!(frames[1].payload(), &[0x30, 0x00, 0x00]);
    assert_eq!(frames[2].payload(), &[0x21, 6, 7, 8, 9, 10, 11, 12]);
    assert_eq!(frames[3].payload(), &[0x22, 13, 14, 15, 16, 17, 18, 19]);
}

#[tokio::test(start_paused = true)]
/// Lengths around every frame boundary, normal addressing on classic CAN.
async fn test_round_trip_normal_classic() {
    for len in [1usize, 7, 8, 9, 27, 62, 63, 64, 4095] {
        let data = payload(len);
        let received = round_trip(tester(), ecu(), Options::default(), &data)
            .await
            .unwrap_or_else(|err| panic!("{len} bytes: {err:?}"));
        assert_eq!(received.payload, data, "{len} bytes");
    }
}

/// CAN FD lengths around every frame boundary and both FF length forms.
const FD_LENGTHS: [usize; 11] = [0, 1, 7, 8, 9, 62, 63, 64, 4095, 4096, 65535];

async fn round_trip_fd_lengths(local: Endpoint, peer: Endpoint) {
    let options = Options::builder().fd().build().unwrap();
    for len in FD_LENGTHS {
        let data = payload(len);
        let received = round_trip(local, peer, options, &data)
            .await
            .unwrap_or_else(|err| panic!("{len} bytes (FD): {err:?}"));
        assert_eq!(received.payload, data, "{len} bytes (FD)");
    }
}

#[tokio::test(start_paused = true)]
/// CAN FD: empty and long single frames, 64-byte CFs and the 32-bit FF length.
async fn test_round_trip_normal_fd() {
    round_trip_fd_lengths(tester(), ecu()).await;
}

#[tokio::test(start_paused = true)]
/// Normal-fixed addressing on 29-bit identifiers.
async fn test_round_trip_normal_fixed() {
    let local = Endpoint::normal_fixed(0x10, 0xF1).unwrap();
    let peer = Endpoint::normal_fixed(0xF1, 0x10).unwrap();
    for len in [1usize, 7, 8, 64, 4095] {
        let data = payload(len);
        let received = round_trip(local, peer, Options::default(), &data)
            .await
            .unwrap();
        assert_eq!(received.payload, data, "{len} bytes");
    }
    round_trip_fd_lengths(local, peer).await;
}

#[tokio::test(start_paused = true)]
/// Extended addressing: one byte less per frame for the target address.
async fn test_round_trip_extended() {
    let local = Endpoint::extended(sid(0x600), sid(0x601), 0x20, 0x10);
    let peer = Endpoint::extended(sid(0x601), sid(0x600), 0x10, 0x20);
    for len in [1usize, 6, 7, 8, 62, 63, 4095] {
        let data = payload(len);
        let received = round_trip(local, peer, Options::default(), &data)
            .await
            .unwrap();
        assert_eq!(received.payload, data, "{len} bytes");
    }
    round_trip_fd_lengths(local, peer).await;
}

#[tokio::test(start_paused = true)]
/// Mixed addressing on 29-bit identifiers, in both frame modes.
async fn test_round_trip_mixed() {
    let up = CanId::builder(0x10, 0xF1).mixed().build().unwrap();
    let down = CanId::builder(0xF1, 0x10).mixed().build().unwrap();
    let local = Endpoint::mixed(up, down, 0x42);
    let peer = Endpoint::mixed(down, up, 0x42);

    for len in [1usize, 6, 7, 200] {
        let data = payload(len);
        let received = round_trip(local, peer, Options::default(), &data)
            .await
            .unwrap();
        assert_eq!(received.payload, data, "{len} bytes");
    }

    let fd = Options::builder().fd().build().unwrap();
    for len in [61usize, 5000] {
        let data = payload(len);
        let received = round_trip(local, peer, fd, &data).await.unwrap();
        assert_eq!(received.payload, data, "{len} bytes (FD)");
    }
    round_trip_fd_lengths(local, peer).await;
}

#[tokio::test(start_paused = true)]
/// Peer flow control with block size and STmin still delivers everything.
async fn test_round_trip_with_receiver_policy() {
    let options = Options::builder()
        .with_block_size(4)
        .with_st_min(Duration::from_millis(2))
        .with_wait_frames(1)
        .build()
        .unwrap();
    let data = payload(300);
    let received = round_trip(tester(), ecu(), options, &data).await.unwrap();
    assert_eq!(received.payload, data);
}

#[tokio::test(start_paused = true)]
/// An empty payload cannot be framed on classic CAN.
async fn test_empty_payload_rejected() {
    let (bus_a, _bus_b) = MockCanBus::create_pair();
    let cell = ConversationCell::new(tester(), Options::default()).unwrap();
    let scheduler = Scheduler::new();
    let conversation = Conversation::new(&scheduler, &cell).unwrap();
    let mut runner = scheduler.runner(bus_a, TokioTimer::new());

    tokio::select! {
        result = conversation.send(&[]) => assert_eq!(
            result,
            Err(IsoTpError::Malformed(CodecError::InvalidSingleFrameLength { len: 0 }))
        ),
        _ = runner.run() => panic!("runner stopped"),
    }
}

#[tokio::test(start_paused = true)]
/// Controllers reporting TX completion through echo events.
async fn test_round_trip_with_echo_confirmation() {
    let (bus_a, bus_b) = MockCanBus::create_pair();
    let timer = TokioTimer::new();
    let cell_a = ConversationCell::new(tester(), Options::default()).unwrap();
    let cell_b = ConversationCell::new(ecu(), Options::default()).unwrap();
    let scheduler_a = Scheduler::new();
    let scheduler_b = Scheduler::new();
    let a = Conversation::new(&scheduler_a, &cell_a).unwrap();
    let b = Conversation::new(&scheduler_b, &cell_b).unwrap();
    let mut runner_a = scheduler_a.runner(EchoCanBus::new(bus_a), timer.clone());
    let mut runner_b = scheduler_b.runner(bus_b, timer);

    let request = payload(20);
    let response = payload(50);
    let exchange = async {
        let (sent, received) = tokio::join!(a.send(&request), b.recv());
        assert_eq!(sent, Ok(()));
        assert_eq!(received.unwrap().payload, request);

        // The reverse direction makes A send confirmed flow controls.
        let (sent, received) = tokio::join!(b.send(&response), a.recv());
        assert_eq!(sent, Ok(()));
        assert_eq!(received.unwrap().payload, response);
    };

    tokio::select! {
        _ = exchange => {}
        _ = runner_a.run() => panic!("runner A stopped"),
        _ = runner_b.run() => panic!("runner B stopped"),
    }
}

//==================================================================================
// FAILURES
//==================================================================================

#[tokio::test(start_paused = true)]
/// A first frame announcing more than the receiver accepts is refused with OVFLW.
async fn test_overflow_on_both_sides() {
    let receiver = Options::builder().with_max_datagram(100).build().unwrap();
    let (bus_a, bus_b) = MockCanBus::create_pair();
    let wire = bus_a.wire();
    let timer = TokioTimer::new();
    let cell_a = ConversationCell::new(tester(), Options::default()).unwrap();
    let cell_b = ConversationCell::new(ecu(), receiver).unwrap();
    let scheduler_a = Scheduler::new();
    let scheduler_b = Scheduler::new();
    let a = Conversation::new(&scheduler_a, &cell_a).unwrap();
    let b = Conversation::new(&scheduler_b, &cell_b).unwrap();
    let mut runner_a = scheduler_a.runner(bus_a, timer.clone());
    let mut runner_b = scheduler_b.runner(bus_b, timer);

    let data = payload(500);
    tokio::select! {
        (sent, received) = async { tokio::join!(a.send(&data), b.recv()) } => {
            assert_eq!(sent, Err(IsoTpError::Overflow));
            assert_eq!(received, Err(IsoTpError::Overflow));
        }
        _ = runner_a.run() => panic!("runner A stopped"),
        _ = runner_b.run() => panic!("runner B stopped"),
    }

    let frames = wire.lock().unwrap().clone();
    assert_eq!(frames.len(), 2, "FF then OVFLW, no CF");
    assert_eq!(frames[1].payload(), &[0x32, 0x00, 0x00]);
}

#[tokio::test(start_paused = true)]
/// A silent peer makes the sender fail N_Bs, no earlier than 1000 ms and
/// at most one tick later.
async fn test_flow_control_timeout() {
    let (bus_a, _silent) = MockCanBus::create_pair();
    let timer = TokioTimer::new();
    let cell = ConversationCell::new(tester(), Options::default()).unwrap();
    let scheduler = Scheduler::new();
    let conversation = Conversation::new(&scheduler, &cell).unwrap();
    let mut runner = scheduler.runner(bus_a, timer.clone());

    let data = payload(20);
    tokio::select! {
        result = conversation.send(&data) => {
            assert_eq!(result, Err(IsoTpError::Timeout(TimeoutKind::Bs)));
        }
        _ = runner.run() => panic!("runner stopped"),
    }
    let elapsed = timer.elapsed();
    assert!(elapsed >= std::time::Duration::from_millis(1000), "{elapsed:?}");
    assert!(elapsed <= std::time::Duration::from_millis(1002), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
/// A peer that stops after its first frame makes the receiver fail N_Cr.
async fn test_consecutive_frame_timeout() {
    let (bus_a, mut host) = MockCanBus::create_pair();
    let timer = TokioTimer::new();
    let cell = ConversationCell::new(tester(), Options::default()).unwrap();
    let scheduler = Scheduler::new();
    let conversation = Conversation::new(&scheduler, &cell).unwrap();
    let mut runner = scheduler.runner(bus_a, timer.clone());

    let first = frame(0x701, &[0x10, 0x14, 0, 1, 2, 3, 4, 5]);
    host.transmit(&first).await.unwrap();

    tokio::select! {
        received = conversation.recv() => {
            assert_eq!(received, Err(IsoTpError::Timeout(TimeoutKind::Cr)));
        }
        _ = runner.run() => panic!("runner stopped"),
    }
    let elapsed = timer.elapsed();
    assert!(elapsed >= std::time::Duration::from_millis(1000), "{elapsed:?}");
    assert!(elapsed <= std::time::Duration::from_millis(1002), "{elapsed:?}");

    let flow_control = helpers::next_frame(&mut host).await;
    assert_eq!(flow_control.payload(), &[0x30, 0x00, 0x00]);
}

#[tokio::test(start_paused = true)]
/// Cancelling ends the pending send; the next one goes through.
async fn test_cancel_then_send_again() {
    let (bus_a, _silent) = MockCanBus::create_pair();
    let cell = ConversationCell::new(tester(), Options::default()).unwrap();
    let scheduler = Scheduler::new();
    let conversation = Conversation::new(&scheduler, &cell).unwrap();
    let mut runner = scheduler.runner(bus_a, TokioTimer::new());

    let data = payload(20);
    let scenario = async {
        let (sent, _) = tokio::join!(conversation.send(&data), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            assert_eq!(
                conversation.send(&[0x01]).await,
                Err(IsoTpError::Busy),
                "one send at a time"
            );
            conversation.cancel();
        });
        assert_eq!(sent, Err(IsoTpError::Cancelled));
        assert_eq!(conversation.send(&[0x3E, 0x00]).await, Ok(()));
    };

    tokio::select! {
        _ = scenario => {}
        _ = runner.run() => panic!("runner stopped"),
    }
}

//==================================================================================
// REQUEST / RESPONSE
//==================================================================================

static TESTER: StaticCell<ConversationCell> = StaticCell::new();
static ECU: StaticCell<ConversationCell> = StaticCell::new();
static TESTER_SCHEDULER: Scheduler<'static> = Scheduler::new();
static ECU_SCHEDULER: Scheduler<'static> = Scheduler::new();

#[tokio::test(start_paused = true)]
/// The reply routed to `request` is a multi-frame datagram.
async fn test_request_response() {
    let tester_cell: &'static ConversationCell =
        TESTER.init(ConversationCell::new(tester(), Options::default()).unwrap());
    let ecu_cell: &'static ConversationCell =
        ECU.init(ConversationCell::new(ecu(), Options::default()).unwrap());
    let client = Conversation::new(&TESTER_SCHEDULER, tester_cell).unwrap();
    let server = Conversation::new(&ECU_SCHEDULER, ecu_cell).unwrap();

    let (bus_a, bus_b) = MockCanBus::create_pair();
    let timer = TokioTimer::new();
    let mut runner_a = TESTER_SCHEDULER.runner(bus_a, timer.clone());
    let mut runner_b = ECU_SCHEDULER.runner(bus_b, timer.clone());
    let mut client_timer = timer;

    let vin = b"\x62\xF1\x90WVWZZZ1JZXW000001-korri".to_vec();
    let serve = async {
        let request = server.recv().await.unwrap();
        assert_eq!(request.payload, vec![0x22, 0xF1, 0x90]);
        server.send(&vin).await.unwrap();
    };
    let ask = client.request(&[0x22, 0xF1, 0x90], Duration::from_millis(500), &mut client_timer);

    tokio::select! {
        (reply, ()) = async { tokio::join!(ask, serve) } => {
            assert_eq!(reply.unwrap().payload, vin);
        }
        _ = runner_a.run() => panic!("runner A stopped"),
        _ = runner_b.run() => panic!("runner B stopped"),
    }
    // The reply was consumed by the request, not queued.
    assert!(client.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
/// Without a reply, `request` ends with `ResponseTimeout` once the timeout
/// has run from the end of the send.
async fn test_request_timeout() {
    let (bus_a, _silent) = MockCanBus::create_pair();
    let timer = TokioTimer::new();
    let cell = ConversationCell::new(tester(), Options::default()).unwrap();
    let scheduler = Scheduler::new();
    let conversation = Conversation::new(&scheduler, &cell).unwrap();
    let mut runner = scheduler.runner(bus_a, timer.clone());
    let mut client_timer = timer.clone();

    tokio::select! {
        reply = conversation.request(&[0x3E, 0x00], Duration::from_millis(200), &mut client_timer) => {
            assert_eq!(reply, Err(IsoTpError::ResponseTimeout));
        }
        _ = runner.run() => panic!("runner stopped"),
    }
    assert!(timer.elapsed() >= std::time::Duration::from_millis(200));
}
