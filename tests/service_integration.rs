//! End-to-end scenarios driven against a real, running [`Service`].
//!
//! Every test runs `Service::run()` on a background thread and calls
//! `stop()` from the test's own thread once its condition is satisfied:
//! `stop()` busy-waits for every worker thread to drain, so calling it from
//! a coroutine running on one of those very workers would deadlock that
//! worker against itself.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use rt_coro::error::ErrorKind;
use rt_coro::service::{Config, Service};
use rt_coro::sync::Timer;
use rt_coro::tcp::{TcpListener, TcpStream};
use rt_coro::udp::UdpSocket;

fn service_with_threads(n: usize) -> Service {
    let mut cfg = Config::default();
    cfg.threads = n;
    Service::new(cfg).expect("create service")
}

fn localhost(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
}

fn run_until<F>(svc: Service, setup: F)
where
    F: FnOnce(&Service),
{
    let runner = svc.clone();
    let handle = thread::spawn(move || runner.run());
    setup(&svc);
    handle.join().expect("worker thread panicked").expect("service run");
}

/// Scenario: ten coroutines each spawn one child; run on four worker
/// threads. More than one OS thread should end up running the 20 bodies —
/// the precise count the kernel scheduler lands on is not something a test
/// should pin exactly, but a pool that never spreads work across more than
/// one thread would defeat the point of `Service`.
#[test]
fn ten_coroutine_fan_out_spreads_across_worker_threads() {
    let svc = service_with_threads(4);
    let seen: Arc<Mutex<HashSet<ThreadId>>> = Arc::new(Mutex::new(HashSet::new()));
    let (done_tx, done_rx) = mpsc::channel::<()>();

    run_until(svc.clone(), move |svc| {
        for _ in 0..10 {
            let seen = seen.clone();
            let done_tx = done_tx.clone();
            svc.add_coro(move || {
                seen.lock().unwrap().insert(thread::current().id());
                let seen = seen.clone();
                let done_tx = done_tx.clone();
                rt_coro::go(move || {
                    seen.lock().unwrap().insert(thread::current().id());
                    let _ = done_tx.send(());
                });
                let _ = done_tx.send(());
            });
        }
        drop(done_tx);

        for _ in 0..20 {
            done_rx.recv_timeout(Duration::from_secs(5)).expect("coroutine finished");
        }
        svc.stop();
    });
}

/// Scenario: cancelling a descriptor while readers are blocked resumes
/// every one of them with `OperationAborted`, and the socket stays open.
#[test]
fn cancel_unblocks_multiple_readers_without_closing() {
    let svc = service_with_threads(2);
    let aborted = Arc::new(AtomicUsize::new(0));
    let got_bytes = Arc::new(AtomicUsize::new(0));
    let sock_slot: Arc<Mutex<Option<Arc<UdpSocket>>>> = Arc::new(Mutex::new(None));

    run_until(svc.clone(), {
        let sock_slot = sock_slot.clone();
        let aborted = aborted.clone();
        let got_bytes = got_bytes.clone();
        move |svc| {
            let (ready_tx, ready_rx) = mpsc::channel::<()>();
            let (done_tx, done_rx) = mpsc::channel::<()>();
            let sock_slot2 = sock_slot.clone();
            svc.add_coro(move || {
                let sock = Arc::new(UdpSocket::bind(localhost(45123)).expect("bind"));
                *sock_slot2.lock().unwrap() = Some(sock.clone());
                for _ in 0..5 {
                    let sock = sock.clone();
                    let aborted = aborted.clone();
                    let got_bytes = got_bytes.clone();
                    let done_tx = done_tx.clone();
                    rt_coro::go(move || {
                        let mut buf = [0u8; 16];
                        match sock.recv_from(&mut buf) {
                            Err(e) if e.kind() == ErrorKind::OperationAborted => {
                                aborted.fetch_add(1, Ordering::AcqRel);
                            }
                            Ok(_) => {
                                got_bytes.fetch_add(1, Ordering::AcqRel);
                            }
                            Err(_) => {}
                        }
                        let _ = done_tx.send(());
                    });
                }
                let _ = ready_tx.send(());
            });

            ready_rx.recv_timeout(Duration::from_secs(5)).expect("readers spawned");
            // Give the five readers time to reach the suspend point before
            // cancelling them.
            thread::sleep(Duration::from_millis(200));
            sock_slot.lock().unwrap().as_ref().unwrap().cancel();

            for _ in 0..5 {
                done_rx.recv_timeout(Duration::from_secs(5)).expect("reader resumed");
            }
            svc.stop();
        }
    });

    assert_eq!(aborted.load(Ordering::Acquire), 5);
    assert_eq!(got_bytes.load(Ordering::Acquire), 0);
    assert!(
        sock_slot.lock().unwrap().as_ref().unwrap().is_open(),
        "cancel must leave the socket open"
    );
}

/// Scenario: stopping the service while readers are blocked unblocks them
/// with `OperationAborted`.
#[test]
fn stop_unblocks_outstanding_readers() {
    let svc = service_with_threads(2);
    let aborted = Arc::new(AtomicUsize::new(0));

    run_until(svc.clone(), {
        let aborted = aborted.clone();
        move |svc| {
            let (ready_tx, ready_rx) = mpsc::channel::<()>();
            let (done_tx, done_rx) = mpsc::channel::<()>();
            svc.add_coro(move || {
                let sock = Arc::new(UdpSocket::bind(localhost(45130)).expect("bind"));
                for _ in 0..2 {
                    let sock = sock.clone();
                    let aborted = aborted.clone();
                    let done_tx = done_tx.clone();
                    rt_coro::go(move || {
                        let mut buf = [0u8; 16];
                        if let Err(e) = sock.recv_from(&mut buf) {
                            if e.kind() == ErrorKind::OperationAborted {
                                aborted.fetch_add(1, Ordering::AcqRel);
                            }
                        }
                        let _ = done_tx.send(());
                    });
                }
                let _ = ready_tx.send(());
            });

            ready_rx.recv_timeout(Duration::from_secs(5)).expect("readers spawned");
            thread::sleep(Duration::from_millis(200));
            svc.stop();

            for _ in 0..2 {
                done_rx.recv_timeout(Duration::from_secs(5)).expect("reader resumed");
            }
        }
    });

    assert_eq!(aborted.load(Ordering::Acquire), 2);
}

/// Scenario: a TCP echo server with 100-byte buffers and EOF-terminated
/// connections; a client sends ten bytes and reads them back one at a
/// time.
#[test]
fn tcp_echo_round_trips_bytes_in_order() {
    let svc = service_with_threads(2);
    let received: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));

    run_until(svc.clone(), {
        let received = received.clone();
        move |svc| {
            let (listening_tx, listening_rx) = mpsc::channel::<()>();
            let (client_done_tx, client_done_rx) = mpsc::channel::<()>();

            svc.add_coro(move || {
                let listener = TcpListener::bind(localhost(45140)).expect("bind");
                let _ = listening_tx.send(());
                if let Ok((conn, _peer)) = listener.accept() {
                    let mut buf = [0u8; 100];
                    loop {
                        let n = match conn.read(&mut buf) {
                            Ok(n) => n,
                            Err(_) => break,
                        };
                        if n == 0 {
                            break;
                        }
                        let mut written = 0;
                        while written < n {
                            match conn.write(&buf[written..n]) {
                                Ok(w) => written += w,
                                Err(_) => return,
                            }
                        }
                    }
                }
            });

            listening_rx.recv_timeout(Duration::from_secs(5)).expect("listener bound");

            let received = received.clone();
            svc.add_coro(move || {
                let client = TcpStream::connect(localhost(45140)).expect("connect");
                let sent = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 0];
                let mut got = Vec::new();
                for &b in &sent {
                    client.write(&[b]).expect("write byte");
                    let mut buf = [0u8; 1];
                    let n = client.read(&mut buf).expect("read byte");
                    assert_eq!(n, 1);
                    got.push(buf[0]);
                }
                client.close().expect("close client");
                *received.lock().unwrap() = Some(got);
                let _ = client_done_tx.send(());
            });

            client_done_rx.recv_timeout(Duration::from_secs(5)).expect("client finished");
            svc.stop();
        }
    });

    let got = received.lock().unwrap().take().expect("client ran");
    assert_eq!(got, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 0]);
}

/// Mixed sync-primitive stress (mutex half): many coroutines repeatedly
/// acquire a shared mutex; a counter never observes more than one holder
/// at a time.
#[test]
fn mutex_critical_section_never_exceeds_one_holder() {
    let svc = service_with_threads(4);
    let max_observed = Arc::new(AtomicUsize::new(0));

    run_until(svc.clone(), {
        let max_observed = max_observed.clone();
        move |svc| {
            let mutex = Arc::new(rt_coro::sync::Mutex::new());
            let in_section = Arc::new(AtomicUsize::new(0));
            let (done_tx, done_rx) = mpsc::channel::<()>();

            for _ in 0..10 {
                let mutex = mutex.clone();
                let in_section = in_section.clone();
                let max_observed = max_observed.clone();
                let done_tx = done_tx.clone();
                svc.add_coro(move || {
                    for _ in 0..10 {
                        mutex.lock();
                        let now = in_section.fetch_add(1, Ordering::AcqRel) + 1;
                        max_observed.fetch_max(now, Ordering::AcqRel);
                        in_section.fetch_sub(1, Ordering::AcqRel);
                        mutex.unlock();
                        rt_coro::yield_coro();
                    }
                    let _ = done_tx.send(());
                });
            }
            drop(done_tx);

            for _ in 0..10 {
                done_rx.recv_timeout(Duration::from_secs(5)).expect("worker finished");
            }
            svc.stop();
        }
    });

    assert_eq!(max_observed.load(Ordering::Acquire), 1);
}

/// Mixed sync-primitive stress (event half): a single event unblocks ten
/// waiters, is reset, then unblocks a second batch of ten.
#[test]
fn event_unblocks_all_waiters_per_set() {
    let svc = service_with_threads(4);
    let woke_first = Arc::new(AtomicUsize::new(0));
    let woke_second = Arc::new(AtomicUsize::new(0));

    run_until(svc.clone(), {
        let woke_first = woke_first.clone();
        let woke_second = woke_second.clone();
        move |svc| {
            let event = Arc::new(rt_coro::sync::Event::new());
            let (ready_tx, ready_rx) = mpsc::channel::<()>();
            let (done_tx, done_rx) = mpsc::channel::<()>();

            for _ in 0..10 {
                let event = event.clone();
                let woke_first = woke_first.clone();
                let ready_tx = ready_tx.clone();
                let done_tx = done_tx.clone();
                svc.add_coro(move || {
                    let _ = ready_tx.send(());
                    event.wait();
                    woke_first.fetch_add(1, Ordering::AcqRel);
                    let _ = done_tx.send(());
                });
            }
            drop(ready_tx);
            drop(done_tx);

            for _ in 0..10 {
                ready_rx.recv_timeout(Duration::from_secs(5)).expect("waiter registered");
            }
            thread::sleep(Duration::from_millis(100));
            event.set();
            for _ in 0..10 {
                done_rx.recv_timeout(Duration::from_secs(5)).expect("waiter woke");
            }
            assert_eq!(woke_first.load(Ordering::Acquire), 10);

            event.reset();
            let (ready_tx2, ready_rx2) = mpsc::channel::<()>();
            let (done_tx2, done_rx2) = mpsc::channel::<()>();
            for _ in 0..10 {
                let event = event.clone();
                let woke_second = woke_second.clone();
                let ready_tx2 = ready_tx2.clone();
                let done_tx2 = done_tx2.clone();
                svc.add_coro(move || {
                    let _ = ready_tx2.send(());
                    event.wait();
                    woke_second.fetch_add(1, Ordering::AcqRel);
                    let _ = done_tx2.send(());
                });
            }
            drop(ready_tx2);
            drop(done_tx2);

            for _ in 0..10 {
                ready_rx2.recv_timeout(Duration::from_secs(5)).expect("waiter registered");
            }
            thread::sleep(Duration::from_millis(100));
            event.set();
            for _ in 0..10 {
                done_rx2.recv_timeout(Duration::from_secs(5)).expect("waiter woke");
            }

            svc.stop();
        }
    });

    assert_eq!(woke_second.load(Ordering::Acquire), 10);
}

/// Timer fanout: three timers at increasing deadlines plus a cancelled
/// one; a pool of extra coroutines waiting on the longest-lived timer all
/// resume together when it fires, and cancelling the cancelled timer
/// resumes its own waiter with `OperationAborted`.
#[test]
fn timer_fanout_fires_in_order_and_cancellation_aborts_waiters() {
    let svc = service_with_threads(4);
    let fire_order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let long_waiters_done = Arc::new(AtomicUsize::new(0));
    let cancelled_aborted = Arc::new(AtomicUsize::new(0));

    run_until(svc.clone(), {
        let fire_order = fire_order.clone();
        let long_waiters_done = long_waiters_done.clone();
        let cancelled_aborted = cancelled_aborted.clone();
        move |svc| {
            let short = Arc::new(Timer::new());
            let medium = Arc::new(Timer::new());
            let long = Arc::new(Timer::new());
            let cancel_me = Arc::new(Timer::new());

            short.expires_after(Duration::from_millis(60)).unwrap();
            medium.expires_after(Duration::from_millis(120)).unwrap();
            long.expires_after(Duration::from_millis(180)).unwrap();
            cancel_me.expires_after(Duration::from_millis(90)).unwrap();

            let (fire_tx, fire_rx) = mpsc::channel::<()>();
            for (label, timer) in [("short", short.clone()), ("medium", medium.clone()), ("long", long.clone())] {
                let fire_order = fire_order.clone();
                let fire_tx = fire_tx.clone();
                svc.add_coro(move || {
                    timer.wait().expect("timer wait");
                    fire_order.lock().unwrap().push(label);
                    let _ = fire_tx.send(());
                });
            }
            drop(fire_tx);

            let (long_tx, long_rx) = mpsc::channel::<()>();
            for _ in 0..10 {
                let long = long.clone();
                let long_waiters_done = long_waiters_done.clone();
                let long_tx = long_tx.clone();
                svc.add_coro(move || {
                    long.wait().expect("long timer wait");
                    long_waiters_done.fetch_add(1, Ordering::AcqRel);
                    let _ = long_tx.send(());
                });
            }
            drop(long_tx);

            let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
            let cancelled_aborted2 = cancelled_aborted.clone();
            let cancel_me_waiter = cancel_me.clone();
            svc.add_coro(move || {
                if let Err(e) = cancel_me_waiter.wait() {
                    if e.kind() == ErrorKind::OperationAborted {
                        cancelled_aborted2.fetch_add(1, Ordering::AcqRel);
                    }
                }
                let _ = cancel_tx.send(());
            });

            thread::sleep(Duration::from_millis(30));
            assert!(cancel_me.cancel(), "cancel must win the race before the deadline");
            cancel_rx.recv_timeout(Duration::from_secs(5)).expect("cancel waiter resumed");

            for _ in 0..3 {
                fire_rx.recv_timeout(Duration::from_secs(5)).expect("timer fired");
            }
            for _ in 0..10 {
                long_rx.recv_timeout(Duration::from_secs(5)).expect("long waiter resumed");
            }

            svc.stop();
        }
    });

    assert_eq!(cancelled_aborted.load(Ordering::Acquire), 1);
    assert_eq!(*fire_order.lock().unwrap(), vec!["short", "medium", "long"]);
    assert_eq!(long_waiters_done.load(Ordering::Acquire), 10);
}
