//! Serial links to the actor and arm MCUs
//!
//! Each link runs two workers: a reader that turns received bytes into
//! [`PeerReply`] events on the bus, and a writer that drains a bounded
//! queue of encoded frames. Transport failures never panic and never reach
//! the state machine: the reader publishes a [`LinkEvent::Disconnected`]
//! and reopens the channel with a doubling backoff, while unacknowledged
//! commands are left to the scheduler's timeout machinery.

mod transport;

pub use transport::{serial_factory, Transport, TransportFactory, TransportPair};

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arrayvec::ArrayVec;
use parking_lot::Mutex;

use crate::comm::{bounded_channel, Event, EventBus, LinkEvent, Receiver, Sender};
use crate::config::LinkConfig;
use crate::protocol::{decode_reply, Frame, FrameDecoder, Peer, MAX_FRAME_BYTES};
use crate::Result;

/// A frame serialized for the wire
pub type EncodedFrame = ArrayVec<u8, MAX_FRAME_BYTES>;

/// How long the writer worker waits per queue poll
const WRITER_POLL: Duration = Duration::from_millis(50);
/// Backoff sleeps are sliced so `stop()` stays responsive
const BACKOFF_SLICE: Duration = Duration::from_millis(20);

/// Cloneable sending side of a link
pub struct LinkHandle {
    peer: Peer,
    tx: Sender<EncodedFrame>,
    rx: Receiver<EncodedFrame>,
}

impl Clone for LinkHandle {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer,
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl LinkHandle {
    /// Queue a frame for the writer worker
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.tx.try_send(frame.encode())
    }

    /// Drop everything queued but not yet written; returns the count
    pub fn flush(&self) -> usize {
        let n = self.rx.drain().len();
        if n > 0 {
            tracing::debug!(peer = %self.peer, discarded = n, "outbound queue flushed");
        }
        n
    }

    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

/// A serial link and its two workers
pub struct SerialLink {
    peer: Peer,
    handle: LinkHandle,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Open the configured serial device (retried forever in the reader
    /// worker, so a missing device at startup is not fatal)
    pub fn connect(peer: Peer, config: &LinkConfig, bus: EventBus) -> Result<Self> {
        Self::spawn(peer, config, serial_factory(config), bus)
    }

    /// Start the workers over an arbitrary transport factory
    pub fn spawn<F>(peer: Peer, config: &LinkConfig, factory: F, bus: EventBus) -> Result<Self>
    where
        F: TransportFactory + 'static,
    {
        let (tx, rx) = bounded_channel::<EncodedFrame>(config.outbound_queue);
        let handle = LinkHandle { peer, tx, rx };
        let running = Arc::new(AtomicBool::new(true));
        // Write half shared between the workers: the writer uses it, the
        // reader replaces it on reconnect.
        let write_slot: Arc<Mutex<Option<Box<dyn Transport>>>> = Arc::new(Mutex::new(None));

        let spawn_err =
            |e: std::io::Error| crate::Error::InvalidState(format!("cannot spawn link worker: {}", e));

        let reader = {
            let running = Arc::clone(&running);
            let slot = Arc::clone(&write_slot);
            let bus = bus.clone();
            let config = config.clone();
            thread::Builder::new()
                .name(format!("{}-reader", peer))
                .spawn(move || reader_loop(peer, config, factory, slot, bus, running))
                .map_err(spawn_err)?
        };

        let writer = {
            let running = Arc::clone(&running);
            let slot = Arc::clone(&write_slot);
            let rx = handle.rx.clone();
            thread::Builder::new()
                .name(format!("{}-writer", peer))
                .spawn(move || writer_loop(peer, rx, slot, running))
                .map_err(spawn_err)?
        };

        Ok(Self {
            peer,
            handle,
            running,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Stop both workers and wait for them
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
        if let Some(h) = self.writer.take() {
            let _ = h.join();
        }
        tracing::info!(peer = %self.peer, "link stopped");
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read bytes, decode frames, publish replies; owns reconnect
fn reader_loop<F: TransportFactory>(
    peer: Peer,
    config: LinkConfig,
    mut factory: F,
    write_slot: Arc<Mutex<Option<Box<dyn Transport>>>>,
    bus: EventBus,
    running: Arc<AtomicBool>,
) {
    let mut read_half: Option<Box<dyn Transport>> = None;
    let mut decoder = FrameDecoder::new();
    let mut backoff_ms = config.reconnect_delay_ms;
    let mut chunk = vec![0u8; config.read_chunk_size];

    while running.load(Ordering::Relaxed) {
        // The writer clears the slot on write failure; reopen both halves.
        if read_half.is_some() && write_slot.lock().is_none() {
            read_half = None;
            publish(&bus, Event::Link {
                peer,
                event: LinkEvent::Disconnected,
            });
        }

        if read_half.is_none() {
            match factory.open() {
                Ok((r, w)) => {
                    read_half = Some(r);
                    *write_slot.lock() = Some(w);
                    decoder = FrameDecoder::new();
                    backoff_ms = config.reconnect_delay_ms;
                    tracing::info!(%peer, "link connected");
                    publish(&bus, Event::Link {
                        peer,
                        event: LinkEvent::Connected,
                    });
                }
                Err(e) => {
                    tracing::debug!(%peer, error = %e, backoff_ms, "open failed, backing off");
                    sleep_sliced(Duration::from_millis(backoff_ms), &running);
                    backoff_ms = (backoff_ms * 2).min(config.max_reconnect_delay_ms);
                    continue;
                }
            }
        }

        let reader = read_half.as_mut().expect("ensured above");
        match reader.read(&mut chunk) {
            Ok(0) => {
                tracing::warn!(%peer, "transport closed");
                read_half = None;
                *write_slot.lock() = None;
                publish(&bus, Event::Link {
                    peer,
                    event: LinkEvent::Disconnected,
                });
            }
            Ok(n) => {
                for frame in decoder.feed(&chunk[..n]) {
                    match decode_reply(&frame) {
                        Some(reply) => publish(&bus, Event::Reply { peer, reply }),
                        None => {
                            tracing::debug!(%peer, data_type = frame.data_type, "unrecognized frame")
                        }
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                tracing::warn!(%peer, error = %e, "read failed");
                read_half = None;
                *write_slot.lock() = None;
                publish(&bus, Event::Link {
                    peer,
                    event: LinkEvent::Disconnected,
                });
            }
        }
    }
}

/// Drain the outbound queue onto the transport
fn writer_loop(
    peer: Peer,
    rx: Receiver<EncodedFrame>,
    write_slot: Arc<Mutex<Option<Box<dyn Transport>>>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        let bytes = match rx.recv_timeout(WRITER_POLL) {
            Ok(Some(b)) => b,
            Ok(None) => continue,
            Err(_) => break,
        };
        let mut slot = write_slot.lock();
        match slot.as_mut() {
            Some(w) => {
                if let Err(e) = w.write_all(&bytes) {
                    // Reader notices the empty slot and runs the reconnect.
                    tracing::warn!(%peer, error = %e, "write failed, dropping transport");
                    *slot = None;
                }
            }
            None => {
                tracing::debug!(%peer, "link down, frame dropped");
            }
        }
    }
}

fn publish(bus: &EventBus, event: Event) {
    if let Err(e) = bus.publish(event) {
        tracing::warn!(error = %e, "bus rejected link event");
    }
}

fn sleep_sliced(total: Duration, running: &AtomicBool) {
    let mut left = total;
    while !left.is_zero() && running.load(Ordering::Relaxed) {
        let step = left.min(BACKOFF_SLICE);
        thread::sleep(step);
        left = left.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::BusEvent;
    use crate::config::BusConfig;
    use crate::control::{Clock, ManualClock};
    use crate::protocol::{data_type, ActorMotion, CommandId, CommandKind, PeerReply};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    /// In-memory half-duplex pipe with read timeouts, shared by cloning
    #[derive(Clone, Default)]
    struct Pipe {
        state: Arc<(Mutex<PipeState>, parking_lot::Condvar)>,
    }

    #[derive(Default)]
    struct PipeState {
        buf: VecDeque<u8>,
        closed: bool,
    }

    impl Pipe {
        fn close(&self) {
            self.state.0.lock().closed = true;
            self.state.1.notify_all();
        }

        fn take_all(&self) -> Vec<u8> {
            self.state.0.lock().buf.drain(..).collect()
        }
    }

    impl io::Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let (lock, cvar) = &*self.state;
            let mut st = lock.lock();
            if st.buf.is_empty() && !st.closed {
                let _ = cvar.wait_for(&mut st, Duration::from_millis(20));
            }
            if st.buf.is_empty() {
                if st.closed {
                    return Ok(0);
                }
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(st.buf.len());
            for b in buf.iter_mut().take(n) {
                *b = st.buf.pop_front().expect("length checked");
            }
            Ok(n)
        }
    }

    impl io::Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let (lock, cvar) = &*self.state;
            let mut st = lock.lock();
            if st.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
            }
            st.buf.extend(buf);
            cvar.notify_all();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_bus() -> EventBus {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        EventBus::new(&BusConfig::default(), clock)
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            reconnect_delay_ms: 1,
            max_reconnect_delay_ms: 8,
            ..LinkConfig::default()
        }
    }

    /// Factory handing out one pipe pair, then failing
    fn one_shot_factory(
        to_link: Pipe,
        from_link: Pipe,
    ) -> impl TransportFactory {
        let mut pair = Some((to_link, from_link));
        move || -> Result<TransportPair> {
            match pair.take() {
                Some((r, w)) => Ok((Box::new(r) as Box<dyn Transport>, Box::new(w) as _)),
                None => Err(crate::Error::Disconnected("device gone".into())),
            }
        }
    }

    fn wait_for_event<F: Fn(&BusEvent) -> bool>(bus: &EventBus, pred: F) -> Option<BusEvent> {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if let Some(ev) = bus.recv_timeout(Duration::from_millis(50)) {
                if pred(&ev) {
                    return Some(ev);
                }
            }
        }
        None
    }

    #[test]
    fn test_inbound_frames_become_reply_events() {
        let bus = test_bus();
        let to_link = Pipe::default();
        let from_link = Pipe::default();
        let mut link = SerialLink::spawn(
            Peer::Actor,
            &fast_config(),
            one_shot_factory(to_link.clone(), from_link),
            bus.clone(),
        )
        .unwrap();

        let status = Frame::new(data_type::ACTOR_STATUS, &[2]).unwrap();
        io::Write::write_all(&mut to_link.clone(), &status.encode()).unwrap();

        let ev = wait_for_event(&bus, |e| matches!(e.event, Event::Reply { .. }))
            .expect("reply event");
        assert_eq!(
            ev.event,
            Event::Reply {
                peer: Peer::Actor,
                reply: PeerReply::ActorStatus {
                    motion: ActorMotion::Turning,
                    obstacle_cm: None,
                },
            }
        );
        link.stop();
    }

    #[test]
    fn test_outbound_frames_hit_the_wire() {
        let bus = test_bus();
        let to_link = Pipe::default();
        let from_link = Pipe::default();
        let mut link = SerialLink::spawn(
            Peer::Arm,
            &fast_config(),
            one_shot_factory(to_link, from_link.clone()),
            bus.clone(),
        )
        .unwrap();
        wait_for_event(&bus, |e| {
            matches!(
                e.event,
                Event::Link {
                    event: LinkEvent::Connected,
                    ..
                }
            )
        })
        .expect("connected event");

        let frame = crate::protocol::encode_command(
            CommandId(5),
            CommandKind::Pick {
                target: crate::vision::Coordinate::new(1, 2),
            },
        );
        link.handle().send_frame(&frame).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut wire = Vec::new();
        while wire.len() < frame.encode().len() && std::time::Instant::now() < deadline {
            wire.extend(from_link.take_all());
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(wire, frame.encode().to_vec());
        link.stop();
    }

    #[test]
    fn test_closed_transport_publishes_disconnect() {
        let bus = test_bus();
        let to_link = Pipe::default();
        let from_link = Pipe::default();
        let mut link = SerialLink::spawn(
            Peer::Actor,
            &fast_config(),
            one_shot_factory(to_link.clone(), from_link),
            bus.clone(),
        )
        .unwrap();

        to_link.close();
        let ev = wait_for_event(&bus, |e| {
            matches!(
                e.event,
                Event::Link {
                    event: LinkEvent::Disconnected,
                    ..
                }
            )
        });
        assert!(ev.is_some());
        link.stop();
    }

    #[test]
    fn test_reconnect_keeps_retrying_the_factory() {
        let bus = test_bus();
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = {
            let calls = Arc::clone(&calls);
            move || -> Result<TransportPair> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(crate::Error::Disconnected("no device".into()))
            }
        };
        let mut link = SerialLink::spawn(Peer::Arm, &fast_config(), factory, bus).unwrap();

        thread::sleep(Duration::from_millis(80));
        assert!(calls.load(Ordering::SeqCst) >= 3);
        link.stop();
    }

    #[test]
    fn test_decoder_survives_noisy_stream() {
        let bus = test_bus();
        let to_link = Pipe::default();
        let from_link = Pipe::default();
        let mut link = SerialLink::spawn(
            Peer::Actor,
            &fast_config(),
            one_shot_factory(to_link.clone(), from_link),
            bus.clone(),
        )
        .unwrap();

        let ack = Frame::new(data_type::ACK, &[9]).unwrap();
        let mut noisy = vec![0x00, 0xFF, 0x24, 0x11];
        noisy.extend_from_slice(&ack.encode());
        io::Write::write_all(&mut to_link.clone(), &noisy).unwrap();

        let ev = wait_for_event(&bus, |e| matches!(e.event, Event::Reply { .. }))
            .expect("ack decoded after noise");
        assert_eq!(
            ev.event,
            Event::Reply {
                peer: Peer::Actor,
                reply: PeerReply::Ack { id: CommandId(9) },
            }
        );
        link.stop();
    }
}
