/// 重连退避调度
///
/// 纯函数：将重试次数映射到退避延迟。阈值分桶递增，超出最后一桶后封顶。
/// 重试次数上限由会话持有，不在此处判断
use std::time::Duration;

/// 退避分桶：(次数上限, 延迟毫秒)，升序排列，取第一个满足的桶
const BACKOFF_BUCKETS: &[(u32, u64)] = &[
    (2, 500),
    (10, 1000),
    (20, 2000),
    (30, 3000),
    (50, 5000),
    (100, 10_000),
    (200, 15_000),
];

/// 超出所有分桶后的封顶延迟
const BACKOFF_CEILING_MS: u64 = 30_000;

/// 计算第 attempt 次重试的退避延迟（attempt 从 1 开始计数）
pub fn backoff_delay(attempt: u32) -> Duration {
    for &(limit, delay_ms) in BACKOFF_BUCKETS {
        if attempt <= limit {
            return Duration::from_millis(delay_ms);
        }
    }
    Duration::from_millis(BACKOFF_CEILING_MS)
}
