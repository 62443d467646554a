use std::ptr::NonNull;

use noomr::{Config, Sequential, SharedHeap, SpeculationFlag, size_class::MAX_SIZE};

fn heap() -> (SharedHeap, tempfile::TempDir) {
  let _ = env_logger::builder().is_test(true).try_init();
  let dir = tempfile::tempdir().unwrap();
  let heap = SharedHeap::create(
    Config::default()
      .with_backing_root(dir.path())
      .with_segment_bytes(64 << 20),
  )
  .unwrap();
  (heap, dir)
}

/// Allocates `count` blocks of `size` and releases them in order, leaving the last one on top
/// of the free list.
fn released(task: &noomr::Task<'_, &SpeculationFlag>, size: usize, count: usize) -> Vec<NonNull<u8>> {
  let blocks: Vec<_> = (0..count).map(|_| task.allocate(size)).collect();
  for block in &blocks {
    unsafe { task.release(*block) };
  }
  blocks
}

#[test]
fn discarded_episode_leaves_committed_lists_alone() {
  let (heap, _dir) = heap();
  let flag = SpeculationFlag::new();
  let task = heap.task(&flag);
  let blocks = released(&task, 64, 8);

  flag.set(true);
  task.begin_speculation();
  let taken: Vec<_> = (0..12).map(|_| task.allocate(64)).collect();
  assert_eq!(taken[..8], blocks.iter().rev().copied().collect::<Vec<_>>()[..]);
  unsafe { task.release(taken[0]) };
  flag.set(false);

  // No end_speculation: the committed view still has every block, in the same order.
  let again: Vec<_> = (0..8).map(|_| task.allocate(64)).collect();
  assert_eq!(again, blocks.iter().rev().copied().collect::<Vec<_>>());
}

#[test]
fn committed_episode_becomes_the_sequential_state() {
  let (heap, _dir) = heap();
  let flag = SpeculationFlag::new();
  let task = heap.task(&flag);
  let blocks = released(&task, 64, 8);

  flag.set(true);
  task.begin_speculation();
  let taken: Vec<_> = (0..8).map(|_| task.allocate(64)).collect();
  let freed = taken[3];
  unsafe { task.release(freed) };
  task.end_speculation();
  flag.set(false);

  // The block released while speculating is on top, the others are still taken.
  assert_eq!(task.allocate(64), freed);
  for _ in 0..16 {
    let block = task.allocate(64);
    assert!(!blocks.contains(&block), "{block:p} handed out twice");
  }
}

#[test]
fn next_episode_starts_from_the_last_commit() {
  let (heap, _dir) = heap();
  let flag = SpeculationFlag::new();
  let task = heap.task(&flag);
  let blocks = released(&task, 128, 4);

  flag.set(true);
  task.begin_speculation();
  for _ in 0..4 {
    task.allocate(128);
  }

  // Abandon the first episode and start over.
  task.begin_speculation();
  let retry: Vec<_> = (0..4).map(|_| task.allocate(128)).collect();
  assert_eq!(retry, blocks.iter().rev().copied().collect::<Vec<_>>());
}

#[test]
fn speculative_growth_is_counted() {
  let (heap, _dir) = heap();
  let flag = SpeculationFlag::new();
  let task = heap.task(&flag);
  task.allocate(32);
  assert_eq!(heap.spec_growth(), 0);

  flag.set(true);
  task.begin_speculation();
  for _ in 0..100 {
    task.allocate(1000);
  }
  assert!(task.my_growth() > 0);
  assert_eq!(heap.spec_growth(), task.my_growth());
  task.end_speculation();
}

#[test]
fn speculative_huge_blocks_are_file_backed() {
  let (heap, _dir) = heap();
  let flag = SpeculationFlag::new();
  flag.set(true);
  let task = heap.task(&flag);
  task.begin_speculation();

  let huge = task.allocate(3 * MAX_SIZE);
  assert!(!heap.contains(huge.as_ptr()));
  unsafe { huge.as_ptr().write_bytes(0x42, 3 * MAX_SIZE) };
  assert!(std::fs::read_dir(heap.backing_dir()).unwrap().count() >= 1);
  unsafe { task.release(huge) };

  let again = task.allocate(3 * MAX_SIZE);
  unsafe { again.as_ptr().write_bytes(0x43, 3 * MAX_SIZE) };
  unsafe { task.release(again) };
}

#[test]
fn forked_task_commits_are_seen_by_the_sequential_parent() {
  let (heap, _dir) = heap();

  match unsafe { libc::fork() } {
    -1 => panic!("fork: {}", std::io::Error::last_os_error()),
    0 => {
      let flag = SpeculationFlag::new();
      let task = heap.task(&flag);
      flag.set(true);
      task.begin_speculation();
      let blocks: Vec<_> = (0..100).map(|_| task.allocate(64)).collect();
      for block in blocks {
        unsafe { task.release(block) };
      }
      task.end_speculation();
      unsafe { libc::_exit(0) }
    }
    child => {
      let mut status = 0;
      assert_eq!(unsafe { libc::waitpid(child, &mut status, 0) }, child);
      assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);
    }
  }

  // The child's metadata pages are only reachable through their backing files, and the parent
  // never speculated.
  let task = heap.task(Sequential);
  let before = heap.segment_used();
  assert!(before > 0);
  let blocks: Vec<_> = (0..100)
    .map(|_| task.try_allocate(64).expect("committed block is reachable"))
    .collect();
  for block in &blocks {
    assert!(heap.contains(block.as_ptr()));
    unsafe { block.as_ptr().write_bytes(0x99, 64) };
  }
  assert_eq!(heap.segment_used(), before);
}
