use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc as StdArc, Barrier,
    },
    time::Duration,
};

use defines::{
    config::{PAGE_SECTORS, PAGE_SIZE, STACK_MAX, USER_TOP},
    error::errno,
};
use drivers::{BlockDevice, RamDisk, Sector};
use klocks::thread;
use triomphe::Arc;

use super::MemorySpace;
use crate::{EvictPolicyKind, MemFile, PageLocation, VirtAddr, Vm, VmConfig};

const BASE: VirtAddr = VirtAddr(0x0804_8000);

fn vm_with(frames: usize, slots: usize, policy: EvictPolicyKind) -> Arc<Vm> {
    let disk = (slots > 0)
        .then(|| StdArc::new(RamDisk::new(slots * PAGE_SECTORS)) as StdArc<dyn BlockDevice>);
    Vm::new(
        VmConfig {
            frame_count: frames,
            policy,
        },
        disk,
    )
}

fn vm(frames: usize, slots: usize) -> Arc<Vm> {
    vm_with(frames, slots, EvictPolicyKind::Clock)
}

fn nth_page(n: usize) -> VirtAddr {
    BASE.add(n * PAGE_SIZE)
}

fn zero_page(space: &MemorySpace, va: VirtAddr) {
    space.allocate(va, true).unwrap().set_zero_fill();
}

fn fill_page(space: &MemorySpace, va: VirtAddr, byte: u8) {
    space.page_lock(va, true, None).unwrap();
    space.with_pinned(va, true, |data| data.fill(byte));
    space.page_unlock(va);
}

fn read_page(space: &MemorySpace, va: VirtAddr) -> Vec<u8> {
    space.page_lock(va, false, None).unwrap();
    let content = space.with_pinned(va, false, |data| data.to_vec());
    space.page_unlock(va);
    content
}

/// 每写一个扇区都要睡一会儿的磁盘，用来拉长换出的时间窗口
struct SlowDisk {
    disk: RamDisk,
    writes_started: AtomicUsize,
}

impl SlowDisk {
    fn new(slots: usize) -> Self {
        Self {
            disk: RamDisk::new(slots * PAGE_SECTORS),
            writes_started: AtomicUsize::new(0),
        }
    }
}

impl BlockDevice for SlowDisk {
    fn sector_count(&self) -> usize {
        self.disk.sector_count()
    }

    fn read_sector(&self, sector_id: usize, buf: &mut Sector) {
        self.disk.read_sector(sector_id, buf);
    }

    fn write_sector(&self, sector_id: usize, buf: &Sector) {
        self.writes_started.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        self.disk.write_sector(sector_id, buf);
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn zero_page_survives_eviction_to_swap() {
    let vm = vm(4, 16);
    let space = MemorySpace::new(vm.clone());
    zero_page(&space, BASE);
    fill_page(&space, BASE, 0x5A);

    for n in 1..=8 {
        zero_page(&space, nth_page(n));
        fill_page(&space, nth_page(n), n as u8);
    }
    let page = space.page(BASE).unwrap();
    assert_eq!(page.location(), PageLocation::InSwap);
    assert!(page.frame().is_none());
    assert!(space.page_table().translate(page.vpn()).is_none());

    let used_before = vm.swap.used();
    assert!(read_page(&space, BASE).iter().all(|&b| b == 0x5A));
    assert_eq!(page.location(), PageLocation::InFrame);
    // 读回之后 slot 立即释放，但换入时可能又换出了别的页
    assert!(page.swap_slot().is_none());
    assert!(vm.swap.used() <= used_before);

    for n in 1..=8 {
        assert!(read_page(&space, nth_page(n)).iter().all(|&b| b == n as u8));
    }
    assert!(vm.frames.check_links());
}

#[test]
fn partial_writes_round_trip() {
    let vm = vm(1, 4);
    let space = MemorySpace::new(vm);
    zero_page(&space, BASE);
    zero_page(&space, nth_page(1));
    for len in [1, 17, PAGE_SIZE / 2, PAGE_SIZE] {
        space.page_lock(BASE, true, None).unwrap();
        space.with_pinned(BASE, true, |data| data[..len].fill(0xC3));
        space.page_unlock(BASE);
        // 唯一的帧被另一页占去
        fill_page(&space, nth_page(1), 0);
        assert_eq!(space.page(BASE).unwrap().location(), PageLocation::InSwap);

        let content = read_page(&space, BASE);
        assert!(content[..len].iter().all(|&b| b == 0xC3));
        assert!(content[len..].iter().all(|&b| b == 0));
        space.page_lock(BASE, true, None).unwrap();
        space.with_pinned(BASE, true, |data| data.fill(0));
        space.page_unlock(BASE);
    }
}

#[test]
fn read_only_file_pages_are_reread() {
    let vm = vm(2, 8);
    let space = MemorySpace::new(vm.clone());
    let data = patterned(PAGE_SIZE + 100);
    let file = StdArc::new(MemFile::new(data.clone()));
    space
        .map_segment(file, 0, BASE, PAGE_SIZE + 100, PAGE_SIZE - 100, false)
        .unwrap();
    assert_eq!(space.page_count(), 2);

    assert_eq!(read_page(&space, BASE), data[..PAGE_SIZE]);
    let second = read_page(&space, nth_page(1));
    assert_eq!(second[..100], data[PAGE_SIZE..]);
    assert!(second[100..].iter().all(|&b| b == 0));

    for n in 2..5 {
        zero_page(&space, nth_page(n));
        fill_page(&space, nth_page(n), 1);
    }
    for n in 0..2 {
        let page = space.page(nth_page(n)).unwrap();
        assert_eq!(page.location(), PageLocation::FromFile);
        assert!(page.swap_slot().is_none());
    }
    assert_eq!(read_page(&space, BASE), data[..PAGE_SIZE]);
}

#[test]
fn writable_file_pages_go_to_swap() {
    let vm = vm(1, 4);
    let space = MemorySpace::new(vm.clone());
    let file = StdArc::new(MemFile::new(patterned(PAGE_SIZE)));
    space
        .map_segment(file.clone(), 0, BASE, PAGE_SIZE, 0, true)
        .unwrap();
    space.page_lock(BASE, true, None).unwrap();
    space.with_pinned(BASE, true, |data| data[..4].copy_from_slice(b"dirt"));
    space.page_unlock(BASE);

    zero_page(&space, nth_page(1));
    fill_page(&space, nth_page(1), 9);
    assert_eq!(space.page(BASE).unwrap().location(), PageLocation::InSwap);
    assert_eq!(vm.swap.used(), 1);

    let content = read_page(&space, BASE);
    assert_eq!(&content[..4], b"dirt");
    assert_eq!(content[4..], patterned(PAGE_SIZE)[4..]);
}

#[test]
fn random_policy_round_trip() {
    let vm = vm_with(3, 16, EvictPolicyKind::Random);
    let space = MemorySpace::new(vm.clone());
    for n in 0..10 {
        zero_page(&space, nth_page(n));
        fill_page(&space, nth_page(n), 0x10 + n as u8);
    }
    for n in (0..10).rev() {
        assert!(read_page(&space, nth_page(n))
            .iter()
            .all(|&b| b == 0x10 + n as u8));
    }
    assert!(vm.frames.check_links());
    assert_eq!(vm.frames.used_count(), 3);
}

#[test]
fn frames_have_one_resident_owner() {
    let vm = vm(3, 16);
    let spaces: Vec<_> = (0..2).map(|_| MemorySpace::new(vm.clone())).collect();
    for n in 0..6 {
        for (i, space) in spaces.iter().enumerate() {
            zero_page(space, nth_page(n));
            fill_page(space, nth_page(n), (n * 2 + i) as u8);
        }
    }
    let mut owners = HashSet::new();
    for space in &spaces {
        for n in 0..6 {
            let page = space.page(nth_page(n)).unwrap();
            if page.location() == PageLocation::InFrame {
                assert!(owners.insert(page.frame().unwrap()));
            } else {
                assert!(page.frame().is_none());
            }
        }
    }
    assert_eq!(owners.len(), vm.frames.used_count());
    assert!(vm.frames.check_links());
}

#[test]
fn concurrent_page_lock_shares_one_frame() {
    let vm = vm(4, 8);
    let space = StdArc::new(MemorySpace::new(vm.clone()));
    zero_page(&space, BASE);
    let barrier = StdArc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let space = space.clone();
            let barrier = barrier.clone();
            thread::spawn("locker", thread::PRI_DEFAULT, move || {
                barrier.wait();
                space.page_lock(BASE, true, None).unwrap();
                let fid = space.page(BASE).unwrap().frame().unwrap();
                space.with_pinned(BASE, true, |data| data[0] += 1);
                space.page_unlock(BASE);
                fid
            })
            .unwrap()
        })
        .collect();
    let fids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(fids[0], fids[1]);
    assert_eq!(vm.frames.used_count(), 1);
    assert_eq!(read_page(&space, BASE)[0], 2);
}

#[test]
fn deallocate_during_page_in_fails_the_fault() {
    let disk = StdArc::new(SlowDisk::new(4));
    let vm = Vm::new(
        VmConfig {
            frame_count: 1,
            ..VmConfig::default()
        },
        Some(disk.clone()),
    );
    let space = StdArc::new(MemorySpace::new(vm.clone()));
    zero_page(&space, BASE);
    zero_page(&space, nth_page(1));
    fill_page(&space, BASE, 1);
    fill_page(&space, nth_page(1), 2);
    assert_eq!(space.page(BASE).unwrap().location(), PageLocation::InSwap);

    let writes = disk.writes_started.load(Ordering::SeqCst);
    let faulter = {
        let space = space.clone();
        // 唯一的帧要先慢慢换出 nth_page(1)
        thread::spawn("faulter", thread::PRI_DEFAULT, move || {
            space.page_in(BASE, None)
        })
        .unwrap()
    };
    while disk.writes_started.load(Ordering::SeqCst) == writes {
        std::thread::yield_now();
    }
    space.deallocate(BASE);

    assert_eq!(faulter.join().unwrap(), Err(errno::EFAULT));
    assert_eq!(space.page_count(), 1);
    assert_eq!(vm.frames.used_count(), 0);
    // 只剩被换出的 nth_page(1)
    assert_eq!(vm.swap.used(), 1);
    assert!(vm.frames.check_links());
    assert!(read_page(&space, nth_page(1)).iter().all(|&b| b == 2));

    space.exit();
    assert_eq!(vm.frames.used_count(), 0);
    assert_eq!(vm.swap.used(), 0);
}

#[test]
fn deallocate_waits_for_another_threads_pin() {
    let vm = vm(2, 4);
    let space = StdArc::new(MemorySpace::new(vm.clone()));
    zero_page(&space, BASE);
    let (pinned_tx, pinned_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let pinner = {
        let space = space.clone();
        thread::spawn("pinner", thread::PRI_DEFAULT, move || {
            space.page_lock(BASE, true, None).unwrap();
            pinned_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            // 页表项已经不在了，帧仍然钉着
            space.with_pinned(BASE, true, |data| data[0] = 7);
            space.page_unlock(BASE);
        })
        .unwrap()
    };
    pinned_rx.recv().unwrap();

    let remover = {
        let space = space.clone();
        thread::spawn("remover", thread::PRI_DEFAULT, move || {
            space.deallocate(BASE);
        })
        .unwrap()
    };
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(space.page_count(), 0);
    // 还在等帧锁
    assert_eq!(vm.frames.used_count(), 1);
    release_tx.send(()).unwrap();

    pinner.join().unwrap();
    remover.join().unwrap();
    assert_eq!(vm.frames.used_count(), 0);
    assert_eq!(space.page_table().mapped_count(), 0);
}

#[test]
fn exit_while_faulting_releases_everything() {
    let vm = vm(3, 64);
    let space = StdArc::new(MemorySpace::new(vm.clone()));
    for n in 0..9 {
        zero_page(&space, nth_page(n));
    }
    let barrier = StdArc::new(Barrier::new(4));
    let handles: Vec<_> = (0..3)
        .map(|t| {
            let space = space.clone();
            let barrier = barrier.clone();
            thread::spawn("faulter", thread::PRI_DEFAULT, move || {
                barrier.wait();
                for round in 0..20 {
                    for n in (t * 3)..(t * 3 + 3) {
                        let va = nth_page(n);
                        if space.page_lock(va, true, None).is_ok() {
                            space.with_pinned(va, true, |data| data[0] = round as u8);
                            space.page_unlock(va);
                        }
                        let _ = space.page_in(va, None);
                    }
                }
            })
            .unwrap()
        })
        .collect();
    barrier.wait();
    std::thread::sleep(Duration::from_millis(5));
    space.exit();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(space.page_count(), 0);
    assert_eq!(space.page_table().mapped_count(), 0);
    assert_eq!(vm.frames.used_count(), 0);
    assert_eq!(vm.swap.used(), 0);
    assert!(vm.frames.check_links());
}

#[test]
fn pinned_access_may_block() {
    let vm = vm(2, 4);
    let space = StdArc::new(MemorySpace::new(vm.clone()));
    zero_page(&space, BASE);
    zero_page(&space, nth_page(1));
    let (inside_tx, inside_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let reader = {
        let space = space.clone();
        thread::spawn("reader", thread::PRI_DEFAULT, move || {
            space.page_lock(BASE, true, None).unwrap();
            space.with_pinned(BASE, true, |data| {
                inside_tx.send(()).unwrap();
                // 相当于在钉住的页上等一次慢速的文件读
                done_rx.recv().unwrap();
                data[0] = 9;
            });
            space.page_unlock(BASE);
        })
        .unwrap()
    };
    inside_rx.recv().unwrap();

    // 另一个线程仍能分配帧，也能经由 MMU 访问别的页
    space.page_in(nth_page(1), None).unwrap();
    assert_eq!(space.access(nth_page(1), true, |bytes| bytes[0] = 3), Ok(()));
    done_tx.send(()).unwrap();
    reader.join().unwrap();

    assert_eq!(read_page(&space, BASE)[0], 9);
    assert_eq!(read_page(&space, nth_page(1))[0], 3);
}

#[test]
fn concurrent_faults_under_pressure() {
    let vm = vm(4, 64);
    let space = StdArc::new(MemorySpace::new(vm.clone()));
    for n in 0..12 {
        zero_page(&space, nth_page(n));
    }
    let handles: Vec<_> = (0..3)
        .map(|t| {
            let space = space.clone();
            thread::spawn("faulter", thread::PRI_DEFAULT, move || {
                for round in 0..4 {
                    for n in (t * 4)..(t * 4 + 4) {
                        fill_page(&space, nth_page(n), (n + round) as u8);
                    }
                }
            })
            .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    for n in 0..12 {
        assert!(read_page(&space, nth_page(n))
            .iter()
            .all(|&b| b == (n + 3) as u8));
    }
    assert!(vm.frames.check_links());
}

#[test]
fn stack_growth_heuristic() {
    let space = MemorySpace::new(vm(4, 4));
    let esp = VirtAddr(USER_TOP - 2 * PAGE_SIZE + 64);

    // 压栈可能在栈指针下方 32 字节处缺页
    let page = space.page_for_addr(VirtAddr(esp.0 - 32), Some(esp)).unwrap();
    assert_eq!(page.location(), PageLocation::ToBeZeroed);
    assert!(page.is_writable());
    // 同一页再次查找得到同一个页表项
    let again = space.page_for_addr(VirtAddr(esp.0 - 8), Some(esp)).unwrap();
    assert!(Arc::ptr_eq(&page, &again));

    assert!(space
        .page_for_addr(VirtAddr(esp.0 - PAGE_SIZE), Some(esp))
        .is_none());
    assert!(space
        .page_for_addr(VirtAddr(USER_TOP - 5 * PAGE_SIZE), None)
        .is_none());
    let low_esp = VirtAddr(USER_TOP - STACK_MAX - PAGE_SIZE);
    assert!(space
        .page_for_addr(VirtAddr(low_esp.0 - 8), Some(low_esp))
        .is_none());
    assert!(space
        .page_for_addr(VirtAddr(USER_TOP), Some(VirtAddr(USER_TOP)))
        .is_none());
    assert_eq!(space.page_count(), 1);

    // 栈指针之上的访问也合法
    space
        .page_in(VirtAddr(USER_TOP - 8), Some(esp))
        .unwrap();
    assert_eq!(space.page_count(), 2);
    assert_eq!(space.resident_count(), 1);
}

#[test]
fn setup_stack_maps_top_page() {
    let vm = vm(2, 0);
    let space = MemorySpace::new(vm.clone());
    let esp = space.setup_stack().unwrap();
    assert_eq!(esp, VirtAddr(USER_TOP));
    let page = space.page(VirtAddr(USER_TOP - 1)).unwrap();
    assert_eq!(page.location(), PageLocation::InFrame);
    assert!(space.page_table().translate(page.vpn()).is_some());
    assert_eq!(vm.frames.used_count(), 1);
    assert_eq!(space.setup_stack(), Err(errno::EEXIST));
}

#[test]
fn user_access_faults_then_succeeds() {
    let space = MemorySpace::new(vm(2, 2));
    let file = StdArc::new(MemFile::new(patterned(PAGE_SIZE)));
    space.map_segment(file, 0, BASE, PAGE_SIZE, 0, false).unwrap();
    let va = BASE.add(10);

    let fault = space.access(va, false, |bytes| bytes[0]).unwrap_err();
    assert!(fault.not_present);
    assert_eq!(fault.addr, va);

    space.page_in(fault.addr, None).unwrap();
    assert_eq!(space.access(va, false, |bytes| bytes[0]), Ok(patterned(11)[10]));

    let fault = space.access(va, true, |bytes| bytes[0] = 1).unwrap_err();
    assert!(!fault.not_present);
    assert!(fault.write);
}

#[test]
fn write_lock_on_read_only_page_is_refused() {
    let space = MemorySpace::new(vm(2, 2));
    let file = StdArc::new(MemFile::new(patterned(PAGE_SIZE)));
    space.map_segment(file, 0, BASE, PAGE_SIZE, 0, false).unwrap();
    assert_eq!(space.page_lock(BASE, true, None), Err(errno::EACCES));
    assert_eq!(space.page_lock(nth_page(1), false, None), Err(errno::EFAULT));
    assert_eq!(space.vm().frames.used_count(), 0);
}

#[test]
fn swap_exhaustion_fails_the_fault() {
    let vm = vm(1, 0);
    let space = MemorySpace::new(vm.clone());
    zero_page(&space, BASE);
    zero_page(&space, nth_page(1));
    fill_page(&space, BASE, 0xEE);

    assert_eq!(space.page_lock(nth_page(1), false, None), Err(errno::ENOSPC));
    let page = space.page(BASE).unwrap();
    assert_eq!(page.location(), PageLocation::InFrame);
    assert!(space.page_table().translate(page.vpn()).is_some());
    assert!(read_page(&space, BASE).iter().all(|&b| b == 0xEE));
    assert!(vm.frames.check_links());
}

#[test]
fn all_frames_pinned_is_reported() {
    let vm = vm(1, 4);
    let space = MemorySpace::new(vm.clone());
    zero_page(&space, BASE);
    zero_page(&space, nth_page(1));

    space.page_lock(BASE, true, None).unwrap();
    assert_eq!(space.page_in(nth_page(1), None), Err(errno::ENOMEM));
    space.page_unlock(BASE);

    space.page_in(nth_page(1), None).unwrap();
    assert_eq!(space.page(BASE).unwrap().location(), PageLocation::InSwap);
}

#[test]
fn materialization_failures_release_the_frame() {
    let vm = vm(2, 2);
    let space = MemorySpace::new(vm.clone());
    // 没有指定内容来源
    space.allocate(BASE, true).unwrap();
    assert_eq!(space.page_in(BASE, None), Err(errno::EFAULT));

    let file = StdArc::new(MemFile::new(patterned(100)));
    space
        .map_segment(file, 0, nth_page(1), PAGE_SIZE, 0, false)
        .unwrap();
    assert_eq!(space.page_in(nth_page(1), None), Err(errno::EIO));
    assert_eq!(
        space.page(nth_page(1)).unwrap().location(),
        PageLocation::FromFile
    );
    assert_eq!(vm.frames.used_count(), 0);
    assert!(vm.frames.check_links());
}

#[test]
fn deallocate_discards_content() {
    let vm = vm(1, 4);
    let space = MemorySpace::new(vm.clone());
    zero_page(&space, BASE);
    zero_page(&space, nth_page(1));
    fill_page(&space, BASE, 1);
    fill_page(&space, nth_page(1), 2);
    assert_eq!(vm.swap.used(), 1);

    // BASE 在交换区，nth_page(1) 驻留
    space.deallocate(BASE);
    assert_eq!(vm.swap.used(), 0);
    space.deallocate(nth_page(1));
    assert_eq!(vm.frames.used_count(), 0);
    assert_eq!(space.page_count(), 0);
    assert_eq!(space.page_table().mapped_count(), 0);
    assert_eq!(space.page_in(BASE, None), Err(errno::EFAULT));
}

#[test]
fn teardown_releases_frames_and_slots() {
    let vm = vm(2, 8);
    {
        let space = MemorySpace::new(vm.clone());
        for n in 0..5 {
            zero_page(&space, nth_page(n));
            fill_page(&space, nth_page(n), n as u8);
        }
        assert_eq!(vm.frames.used_count(), 2);
        assert_eq!(vm.swap.used(), 3);
        space.exit();
        assert_eq!(space.page_count(), 0);
        assert_eq!(space.page_table().mapped_count(), 0);
        assert_eq!(vm.frames.used_count(), 0);
        assert_eq!(vm.swap.used(), 0);

        zero_page(&space, BASE);
        fill_page(&space, BASE, 1);
    }
    // drop 时同样回收
    assert_eq!(vm.frames.used_count(), 0);
}

#[test]
fn map_segment_rejects_misaligned_segments() {
    let space = MemorySpace::new(vm(1, 0));
    let file = StdArc::new(MemFile::new(patterned(PAGE_SIZE)));
    assert_eq!(
        space.map_segment(file.clone(), 0, BASE.add(1), PAGE_SIZE, 0, false),
        Err(errno::EINVAL)
    );
    assert_eq!(
        space.map_segment(file.clone(), 0, BASE, 100, 0, false),
        Err(errno::EINVAL)
    );
    assert_eq!(
        space.map_segment(file, 0, VirtAddr(USER_TOP), PAGE_SIZE, 0, false),
        Err(errno::EFAULT)
    );
}
