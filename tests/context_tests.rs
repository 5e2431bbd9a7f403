//! Mount context tests: node deduplication, handle lookup, concurrent
//! access, and the idle-unmount state machine.

mod common;

use std::sync::Arc;

use common::harness::{fast_params, mount};

#[test]
fn concurrent_opens_share_one_node() {
    let m = mount(fast_params());
    m.write_file("/shared.txt", b"one node to rule them all");

    let first = m.root.open_node("/shared.txt", false).unwrap();
    let second = m.root.open_node("/shared.txt", false).unwrap();
    assert!(
        Arc::ptr_eq(&first, &second),
        "same path must share one node"
    );

    // releases are counted; the node stays live until the last one
    m.ctx.erase_node("/shared.txt", &first);
    let third = m.root.open_node("/shared.txt", false).unwrap();
    assert!(Arc::ptr_eq(&second, &third));
    m.ctx.erase_node("/shared.txt", &second);
    m.ctx.erase_node("/shared.txt", &third);

    assert!(m.ctx.lookup_node("/shared.txt").is_none());
}

#[test]
fn racing_opens_converge_on_one_node() {
    let m = mount(fast_params());
    m.write_file("/raced", b"contended");

    let root = Arc::clone(&m.root);
    let mut joins = Vec::new();
    for _ in 0..8 {
        let root = Arc::clone(&root);
        joins.push(std::thread::spawn(move || {
            root.open_node("/raced", false).unwrap()
        }));
    }
    let nodes: Vec<_> = joins.into_iter().map(|j| j.join().unwrap()).collect();
    for node in &nodes[1..] {
        assert!(Arc::ptr_eq(&nodes[0], node));
    }
    for node in &nodes {
        m.ctx.erase_node("/raced", node);
    }
}

#[test]
fn handle_lookup_matches_node() {
    let m = mount(fast_params());
    m.write_file("/by-handle", b"x");

    let node = m.root.open_node("/by-handle", false).unwrap();
    let fh = node.fuse_fh;
    assert!(fh >= 1);

    let via_fh = m.ctx.lookup_fh(fh).expect("handle registered");
    assert!(Arc::ptr_eq(&node, &via_fh));

    m.ctx.erase_node("/by-handle", &node);
    assert!(m.ctx.lookup_fh(fh).is_none(), "handle dies with last release");
}

#[test]
fn concurrent_readers_see_identical_bytes() {
    let m = mount(fast_params());
    let data: Vec<u8> = (0..50_000).map(|i| (i * 13 % 256) as u8).collect();
    m.write_file("/fanout.bin", &data);

    let node = m.root.open_node("/fanout.bin", false).unwrap();
    let mut joins = Vec::new();
    for t in 0..6 {
        let node = Arc::clone(&node);
        let expected = data.clone();
        joins.push(std::thread::spawn(move || {
            // interleave whole-file and scattered reads
            for round in 0..5 {
                let offset = ((t * 7919 + round * 104729) % 40_000) as u64;
                let mut buf = vec![0u8; 4096];
                let n = node.read(offset, &mut buf).unwrap();
                assert_eq!(&buf[..n], &expected[offset as usize..offset as usize + n]);
            }
            let mut all = vec![0u8; expected.len()];
            assert_eq!(node.read(0, &mut all).unwrap(), expected.len());
            assert_eq!(all, expected);
        }));
    }
    for j in joins {
        j.join().unwrap();
    }
    m.ctx.erase_node("/fanout.bin", &node);
}

#[test]
fn idle_timeout_drives_unmount() {
    let m = mount(fast_params());
    let timeout_cycles = 3;

    // activity resets the idle countdown
    let _ = m.ctx.get_root().unwrap();
    assert!(!m.ctx.usage_and_unmount(timeout_cycles));

    // idle cycles accumulate until the timeout fires
    let mut fired = false;
    for _ in 0..timeout_cycles + 1 {
        fired = m.ctx.usage_and_unmount(timeout_cycles);
        if fired {
            break;
        }
    }
    assert!(fired, "idle mount must request an unmount");
    assert!(m.ctx.is_unmounting());

    // once unmounting, accesses are refused
    let err = m.ctx.get_root().unwrap_err();
    assert_eq!(err.to_errno(), libc::EBUSY);
}

#[test]
fn open_files_hold_off_the_unmount() {
    let m = mount(fast_params());
    m.write_file("/pin", b"keepalive");
    let node = m.root.open_node("/pin", false).unwrap();

    for _ in 0..10 {
        assert!(
            !m.ctx.usage_and_unmount(2),
            "unmount must wait for open files"
        );
    }
    assert!(!m.ctx.is_unmounting());

    m.ctx.erase_node("/pin", &node);
    drop(node);

    let mut fired = false;
    for _ in 0..3 {
        fired = m.ctx.usage_and_unmount(2);
        if fired {
            break;
        }
    }
    assert!(fired);
}

#[test]
fn mount_on_demand_remounts_lazily() {
    let m = common::harness::mount_with(fast_params(), |opts| opts.mount_on_demand = true);
    m.write_file("/warm", b"still here");

    let mut fired = false;
    for _ in 0..5 {
        fired = m.ctx.usage_and_unmount(2);
        if fired {
            break;
        }
    }
    assert!(fired, "idle detection still reports");
    assert!(
        !m.ctx.is_unmounting(),
        "on-demand mounts stay ready for remount"
    );

    // the host detaches the idle mount; the next access rebuilds the root
    // from the retained mount parameters
    m.ctx.detach_root();
    let root = m.ctx.get_root().expect("lazy remount");
    assert!(!Arc::ptr_eq(&root, &m.root), "a fresh root was built");

    let node = root.open_node("/warm", false).unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(node.read(0, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"still here");
    m.ctx.erase_node("/warm", &node);

    // the remounted root is reused on subsequent accesses
    let again = m.ctx.get_root().unwrap();
    assert!(Arc::ptr_eq(&root, &again));
}
