//! 驱动数据处理的小步骤。

/// 只放行与上一个值不同的值。
#[derive(Debug, Clone, Default)]
pub struct DistinctUntilChanged<T> {
    last: Option<T>,
}

impl<T: PartialEq + Clone> DistinctUntilChanged<T> {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// 与上一个值不同则返回 `Some(value)`，否则返回 `None`。
    pub fn push(&mut self, value: T) -> Option<T> {
        if self.last.as_ref() == Some(&value) {
            return None;
        }
        self.last = Some(value.clone());
        Some(value)
    }

    pub fn last(&self) -> Option<&T> {
        self.last.as_ref()
    }

    /// 忘记上一个值，下一个值一定会被放行。
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppresses_repeats() {
        let mut step = DistinctUntilChanged::new();
        let out: Vec<i32> = [1, 1, 2, 2, 2, 1, 3, 3].into_iter().filter_map(|v| step.push(v)).collect();
        assert_eq!(out, vec![1, 2, 1, 3]);
        assert_eq!(step.last(), Some(&3));
    }

    #[test]
    fn test_reset_lets_same_value_through() {
        let mut step = DistinctUntilChanged::new();
        assert_eq!(step.push(vec![1u8, 2]), Some(vec![1, 2]));
        assert_eq!(step.push(vec![1u8, 2]), None);
        step.reset();
        assert_eq!(step.push(vec![1u8, 2]), Some(vec![1, 2]));
    }
}
