//! Transmit-pool accounting, run in its own process so the global
//! counters see only this scenario.

use arq256::{pool, protocol::OVERHEAD, Command, ControlBlock, SegmentHeader};

/// Raise the peer's advertised window without a real peer.
fn advertise_window(cb: &mut ControlBlock, conv: u32, wnd: u16) {
    let mut dgram = [0u8; OVERHEAD];
    SegmentHeader {
        conv,
        cmd: Command::WindowTell as u8,
        wnd,
        ..Default::default()
    }
    .encode(&mut dgram);
    cb.input(&dgram, true, false, 0, &mut |_d: &mut [u8]| {})
        .unwrap();
}

#[test]
fn transmit_pool_balances() {
    let base = pool::outstanding();

    // A full send/ack/recv conversation returns every buffer it took.
    {
        let mut a = ControlBlock::new(77);
        let mut b = ControlBlock::new(77);
        a.set_nodelay(true, 10, 0, true);
        b.set_nodelay(true, 10, 0, true);
        a.set_window_size(256, 256);
        b.set_window_size(256, 256);

        for i in 0..50u8 {
            a.send(&[i; 500]).unwrap();
        }

        let mut buf = [0u8; 2048];
        let mut now = 0u32;
        for _ in 0..200 {
            let mut a_wire = Vec::new();
            a.update(now, &mut |d: &mut [u8]| a_wire.push(d.to_vec()));
            for dgram in a_wire {
                b.input(&dgram, true, false, now, &mut |_d: &mut [u8]| {})
                    .unwrap();
            }
            while b.recv(&mut buf).is_ok() {}

            let mut b_wire = Vec::new();
            b.update(now, &mut |d: &mut [u8]| b_wire.push(d.to_vec()));
            for dgram in b_wire {
                a.input(&dgram, true, false, now, &mut |_d: &mut [u8]| {})
                    .unwrap();
            }

            if a.wait_snd() == 0 {
                break;
            }
            now += 10;
        }
        assert_eq!(a.wait_snd(), 0, "conversation never drained");
    }
    assert_eq!(pool::outstanding(), base);

    // A flush with every retransmission timer in the future touches the
    // pool not at all, even with thousands of segments pending.
    let mut cb = ControlBlock::new(78);
    cb.set_nodelay(true, 10, 0, true);
    cb.set_window_size(4096, 4096);
    advertise_window(&mut cb, 78, 4096);

    for _ in 0..2048 {
        cb.send(&[0u8; 32]).unwrap();
    }
    cb.flush(false, 0, &mut |_d: &mut [u8]| {});
    assert_eq!(cb.wait_snd(), 2048);

    let before = pool::outstanding();
    cb.flush(false, 1, &mut |_d: &mut [u8]| {});
    assert_eq!(pool::outstanding(), before);

    drop(cb);
    assert_eq!(pool::outstanding(), base);
}
