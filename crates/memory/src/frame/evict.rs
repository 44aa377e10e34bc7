use super::{Frame, FrameId};

/// 换出策略，决定没有空闲帧时牺牲哪一个
pub trait EvictPolicy: Send {
    /// 选出一个牺牲帧，返回时已持有它的锁。所有帧都被钉住时返回 `None`
    ///
    /// 只能选择不阻塞就能锁住的帧
    fn pick_victim(&mut self, frames: &[Frame]) -> Option<FrameId>;
}

/// 时钟算法，即 second chance：最近被访问过的页清掉访问位后跳过一次
#[derive(Default)]
pub struct Clock {
    hand: usize,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictPolicy for Clock {
    fn pick_victim(&mut self, frames: &[Frame]) -> Option<FrameId> {
        if frames.is_empty() {
            return None;
        }
        // 转两圈。第一圈清掉的访问位，第二圈就不会再挡住它了
        for _ in 0..2 * frames.len() {
            let idx = self.hand;
            self.hand = (self.hand + 1) % frames.len();
            let frame = &frames[idx];
            if !frame.try_lock() {
                continue;
            }
            match frame.page() {
                Some(page) if page.accessed_recently() => frame.unlock(),
                _ => return Some(FrameId(idx)),
            }
        }
        None
    }
}

/// 随机选择
pub struct RandomEvict {
    rng: fastrand::Rng,
}

impl RandomEvict {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }
}

impl Default for RandomEvict {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictPolicy for RandomEvict {
    fn pick_victim(&mut self, frames: &[Frame]) -> Option<FrameId> {
        if frames.is_empty() {
            return None;
        }
        // 从随机位置开始探测一圈
        let start = self.rng.usize(..frames.len());
        (0..frames.len())
            .map(|i| (start + i) % frames.len())
            .find(|&idx| frames[idx].try_lock())
            .map(FrameId)
    }
}
