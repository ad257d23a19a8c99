//! Fixed-capacity ring buffer
//! 固定容量环形缓冲区
//!
//! Used for rolling statistics (acquire wait times, queue-length samples)
//! where only the most recent N observations matter. Push is O(1); once the
//! buffer is full the oldest sample is overwritten.
//! 用于滚动统计（获取等待时间、队列长度采样），只保留最近 N 个观测值。

/// Circular buffer holding at most `capacity` samples / 最多保存 `capacity` 个样本的环形缓冲区
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Next write position / 下一个写入位置
    head: usize,
    len: usize,
}

impl<T: Copy> RingBuffer<T> {
    /// Create a buffer with the given capacity (minimum 1) / 创建指定容量的缓冲区（至少为1）
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    /// Push a sample, evicting the oldest one when full / 写入样本，满时覆盖最旧样本
    pub fn push(&mut self, value: T) {
        let capacity = self.slots.len();
        self.slots[self.head] = Some(value);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Drop every sample / 清空所有样本
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.len = 0;
    }

    /// Most recently pushed sample / 最近写入的样本
    pub fn last(&self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let capacity = self.slots.len();
        self.slots[(self.head + capacity - 1) % capacity]
    }

    /// Iterate samples from oldest to newest / 从最旧到最新遍历样本
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        let capacity = self.slots.len();
        let start = (self.head + capacity - self.len) % capacity;
        (0..self.len).filter_map(move |offset| self.slots[(start + offset) % capacity])
    }

    /// Copy samples out, oldest first / 按从旧到新的顺序复制样本
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }
}

impl<T: Copy + Into<f64>> RingBuffer<T> {
    /// Arithmetic mean of the retained samples, 0.0 when empty / 样本算术平均值，空时为0.0
    pub fn average(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.iter().map(Into::into).sum::<f64>() / self.len as f64
    }

    /// Largest retained sample / 最大样本
    pub fn max(&self) -> Option<f64> {
        self.iter()
            .map(Into::into)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_capacity() {
        let mut buffer = RingBuffer::new(4);
        buffer.push(1u32);
        buffer.push(2);
        buffer.push(3);

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.to_vec(), vec![1, 2, 3]);
        assert_eq!(buffer.last(), Some(3));
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let mut buffer = RingBuffer::new(3);
        for v in 1u32..=5 {
            buffer.push(v);
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.capacity(), 3);
        assert_eq!(buffer.to_vec(), vec![3, 4, 5]);
        assert_eq!(buffer.last(), Some(5));
    }

    #[test]
    fn test_average_and_max() {
        let mut buffer = RingBuffer::new(3);
        assert_eq!(buffer.average(), 0.0);
        assert_eq!(buffer.max(), None);

        buffer.push(10u32);
        buffer.push(20);
        buffer.push(30);
        buffer.push(40);

        assert_eq!(buffer.average(), 30.0);
        assert_eq!(buffer.max(), Some(40.0));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buffer = RingBuffer::new(0);
        buffer.push(7u32);
        buffer.push(8);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.to_vec(), vec![8]);
    }

    #[test]
    fn test_clear() {
        let mut buffer = RingBuffer::new(2);
        buffer.push(1.5f64);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.last(), None);
        buffer.push(2.5);
        assert_eq!(buffer.to_vec(), vec![2.5]);
    }
}
