//! Arbitration tests: passes are driven by hand with explicit instants and
//! the resulting bus traffic is read back on the host side of the mock bus.

mod helpers {
    include!("../../../helpers/mod.rs");
}

use std::sync::atomic::Ordering;

use embassy_time::{Duration, Instant};
use helpers::{frame, next_frame, sid, MockCanBus, TokioTimer};
use korri_isotp::error::{IsoTpError, SchedulerError};
use korri_isotp::protocol::transport::isotp::{
    conversation::ConversationCell,
    endpoint::Endpoint,
    facade::Conversation,
    options::Options,
    scheduler::Scheduler,
};
use korri_isotp::protocol::transport::traits::can_bus::BusEvent;

fn cell(tx: u16, rx: u16, options: Options) -> ConversationCell {
    ConversationCell::new(Endpoint::normal(sid(tx), sid(rx)), options).unwrap()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

fn at(millis: u64) -> Instant {
    Instant::from_millis(millis)
}

const CTS: [u8; 3] = [0x30, 0x00, 0x00];

#[tokio::test]
/// A flow control queued by one conversation leaves before the next data
/// frame of another conversation's long transfer.
async fn test_flow_control_not_starved() {
    let (bus, mut host) = MockCanBus::create_pair();
    let sender = cell(0x700, 0x701, Options::default());
    let receiver = cell(0x710, 0x711, Options::default());
    let scheduler = Scheduler::new();
    scheduler.register(&sender).unwrap();
    scheduler.register(&receiver).unwrap();
    let mut runner = scheduler.runner(bus, TokioTimer::new());

    sender
        .update(|core| core.begin_send(&payload(100)))
        .unwrap();
    assert!(runner.pass(at(0)).await);
    runner.dispatch(BusEvent::Received(frame(0x701, &CTS)), at(0));
    assert!(runner.pass(at(0)).await);

    // Peer starts a transfer towards `receiver` mid-stream.
    runner.dispatch(
        BusEvent::Received(frame(0x711, &[0x10, 0x14, 0, 1, 2, 3, 4, 5])),
        at(0),
    );
    assert!(runner.pass(at(0)).await);

    let ff = next_frame(&mut host).await;
    let cf1 = next_frame(&mut host).await;
    let fc = next_frame(&mut host).await;
    let cf2 = next_frame(&mut host).await;
    assert_eq!(ff.payload()[0] & 0xF0, 0x10);
    assert_eq!(cf1.payload()[0], 0x21);
    assert_eq!(fc.id, sid(0x710));
    assert_eq!(fc.payload(), &CTS);
    assert_eq!(cf2.id, sid(0x700));
    assert_eq!(cf2.payload()[0], 0x22);
}

#[tokio::test]
/// Ready conversations take turns, one data frame per pass.
async fn test_data_frames_alternate() {
    let (bus, mut host) = MockCanBus::create_pair();
    let first = cell(0x700, 0x701, Options::default());
    let second = cell(0x710, 0x711, Options::default());
    let scheduler = Scheduler::new();
    scheduler.register(&first).unwrap();
    scheduler.register(&second).unwrap();
    let mut runner = scheduler.runner(bus, TokioTimer::new());

    first.update(|core| core.begin_send(&payload(30))).unwrap();
    second.update(|core| core.begin_send(&payload(30))).unwrap();

    assert!(runner.pass(at(0)).await);
    assert!(runner.pass(at(0)).await);
    runner.dispatch(BusEvent::Received(frame(0x701, &CTS)), at(1));
    runner.dispatch(BusEvent::Received(frame(0x711, &CTS)), at(1));
    for _ in 0..4 {
        assert!(runner.pass(at(1)).await);
    }

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(next_frame(&mut host).await.id.raw());
    }
    assert_eq!(ids, vec![0x700, 0x710, 0x700, 0x710, 0x700, 0x710]);
}

#[tokio::test]
/// The bus guard spaces data frames; flow controls are exempt.
async fn test_bus_guard() {
    let guarded = Options::builder()
        .with_bus_guard(Duration::from_millis(10))
        .build()
        .unwrap();
    let (bus, mut host) = MockCanBus::create_pair();
    let sender = cell(0x700, 0x701, guarded);
    let receiver = cell(0x710, 0x711, Options::default());
    let scheduler = Scheduler::new();
    scheduler.register(&sender).unwrap();
    scheduler.register(&receiver).unwrap();
    let mut runner = scheduler.runner(bus, TokioTimer::new());

    sender.update(|core| core.begin_send(&payload(20))).unwrap();
    assert!(runner.pass(at(0)).await);
    runner.dispatch(BusEvent::Received(frame(0x701, &CTS)), at(0));
    assert!(!runner.pass(at(5)).await, "guard still running");

    runner.dispatch(
        BusEvent::Received(frame(0x711, &[0x10, 0x0A, 0, 1, 2, 3, 4, 5])),
        at(6),
    );
    assert!(runner.pass(at(6)).await, "flow control ignores the guard");
    assert!(runner.pass(at(10)).await);

    assert_eq!(next_frame(&mut host).await.id, sid(0x700));
    assert_eq!(next_frame(&mut host).await.id, sid(0x710));
    let cf = next_frame(&mut host).await;
    assert_eq!(cf.id, sid(0x700));
    assert_eq!(cf.payload()[0], 0x21);
}

#[tokio::test(start_paused = true)]
/// A bus that accepts nothing fails the send; the next send works again.
async fn test_bus_rejected() {
    let (bus, _host) = MockCanBus::create_pair();
    let accept = bus.accept_switch();
    let conversation_cell = cell(0x700, 0x701, Options::default());
    let scheduler = Scheduler::new();
    let conversation = Conversation::new(&scheduler, &conversation_cell).unwrap();
    let mut runner = scheduler.runner(bus, TokioTimer::new());

    accept.store(false, Ordering::SeqCst);
    let scenario = async {
        assert_eq!(
            conversation.send(&[0x10, 0x03]).await,
            Err(IsoTpError::BusRejected)
        );
        accept.store(true, Ordering::SeqCst);
        assert_eq!(conversation.send(&[0x10, 0x03]).await, Ok(()));
    };

    tokio::select! {
        _ = scenario => {}
        _ = runner.run() => panic!("runner stopped"),
    }
}

#[tokio::test(start_paused = true)]
/// A receive fault ends the runner and fails every registered conversation.
async fn test_bus_fault_tears_down() {
    let (bus, host) = MockCanBus::create_pair();
    let conversation_cell = cell(0x700, 0x701, Options::default());
    let scheduler = Scheduler::new();
    let conversation = Conversation::new(&scheduler, &conversation_cell).unwrap();
    let mut runner = scheduler.runner(bus, TokioTimer::new());

    let data = payload(20);
    let drive = async {
        let run = runner.run();
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => panic!("runner stopped early: {result:?}"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
        }
        // Closing the peer side makes the receive path fail.
        drop(host);
        run.await
    };

    let (sent, stopped) = tokio::join!(conversation.send(&data), drive);
    assert_eq!(sent, Err(IsoTpError::BusFault));
    assert!(matches!(stopped, Err(SchedulerError::Bus(()))));
    assert!(!scheduler.is_registered(&conversation_cell));

    // Nothing would ever transmit for a conversation the runner dropped.
    assert_eq!(conversation.send(&[0x3E, 0x00]).await, Err(IsoTpError::NotRegistered));
    let mut timer = TokioTimer::new();
    let reply = conversation
        .request(&[0x22, 0xF1, 0x90], Duration::from_millis(100), &mut timer)
        .await;
    assert_eq!(reply, Err(IsoTpError::NotRegistered));
}

#[tokio::test]
/// Dropping the handle unregisters and frees the endpoint.
async fn test_drop_unregisters() {
    let first = cell(0x700, 0x701, Options::default());
    let again = cell(0x702, 0x701, Options::default());
    let scheduler = Scheduler::new();

    let conversation = Conversation::new(&scheduler, &first).unwrap();
    assert_eq!(conversation.endpoint().rx_id, sid(0x701));
    assert_eq!(
        Conversation::new(&scheduler, &again).err(),
        Some(IsoTpError::DuplicateEndpoint)
    );
    drop(conversation);
    assert!(!scheduler.is_registered(&first));
    assert!(Conversation::new(&scheduler, &again).is_ok());
}
