use serde::{Deserialize, Serialize};
use std::fmt;

use super::sync_task::SyncAction;

/// 队列优先级枚举
///
/// 任务上的优先级是裸 u8（数值越大越紧急，调用方可以用任意数值），
/// 本枚举提供常用的命名档位：
/// - Critical: 最高优先级（取消预约、删除等用户急需生效的操作）
/// - High: 高优先级（修改预约时间/地址等用户直接感知的变更）
/// - Normal: 普通优先级（新建预约、资料更新）
/// - Low: 低优先级（备注、偏好设置）
/// - Background: 后台优先级（统计类写入）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueuePriority {
    Background = 0,
    Low = 1,
    Normal = 3,
    High = 5,
    Critical = 8,
}

impl QueuePriority {
    /// 根据变更动作获取默认优先级
    pub fn from_action(action: SyncAction) -> Self {
        match action {
            SyncAction::Delete => QueuePriority::Critical,
            SyncAction::Update => QueuePriority::High,
            SyncAction::Create => QueuePriority::Normal,
        }
    }

    /// 获取优先级的数值
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// 从数值创建优先级（仅精确匹配命名档位）
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(QueuePriority::Background),
            1 => Some(QueuePriority::Low),
            3 => Some(QueuePriority::Normal),
            5 => Some(QueuePriority::High),
            8 => Some(QueuePriority::Critical),
            _ => None,
        }
    }

    /// 获取优先级的显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            QueuePriority::Critical => "关键",
            QueuePriority::High => "高",
            QueuePriority::Normal => "普通",
            QueuePriority::Low => "低",
            QueuePriority::Background => "后台",
        }
    }

    /// 获取优先级的英文名称
    pub fn name(&self) -> &'static str {
        match self {
            QueuePriority::Critical => "critical",
            QueuePriority::High => "high",
            QueuePriority::Normal => "normal",
            QueuePriority::Low => "low",
            QueuePriority::Background => "background",
        }
    }

    /// 检查是否为高优先级（Critical 或 High）
    pub fn is_high_priority(&self) -> bool {
        matches!(self, QueuePriority::Critical | QueuePriority::High)
    }

    /// 检查是否为低优先级（Low 或 Background）
    pub fn is_low_priority(&self) -> bool {
        matches!(self, QueuePriority::Low | QueuePriority::Background)
    }

    /// 获取所有优先级的列表
    pub fn all() -> Vec<Self> {
        vec![
            QueuePriority::Critical,
            QueuePriority::High,
            QueuePriority::Normal,
            QueuePriority::Low,
            QueuePriority::Background,
        ]
    }
}

impl fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl Default for QueuePriority {
    fn default() -> Self {
        QueuePriority::Normal
    }
}

/// 裸数值归档到最近的命名档位（显示 / 统计用）
impl From<u8> for QueuePriority {
    fn from(value: u8) -> Self {
        match value {
            0 => QueuePriority::Background,
            1..=2 => QueuePriority::Low,
            3..=4 => QueuePriority::Normal,
            5..=7 => QueuePriority::High,
            _ => QueuePriority::Critical,
        }
    }
}

impl From<QueuePriority> for u8 {
    fn from(priority: QueuePriority) -> Self {
        priority.value()
    }
}

/// 优先级比较器
///
/// 用于队列排序，确保高优先级任务先处理（数值大的在前）
pub struct PriorityComparator;

impl PriorityComparator {
    /// 队列处理顺序比较（降序：数值大的排前面）
    pub fn process_order(a: u8, b: u8) -> std::cmp::Ordering {
        b.cmp(&a)
    }

    /// 检查优先级 a 是否高于优先级 b
    pub fn is_higher(a: u8, b: u8) -> bool {
        a > b
    }

    /// 检查优先级 a 是否低于优先级 b
    pub fn is_lower(a: u8, b: u8) -> bool {
        a < b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(QueuePriority::Critical > QueuePriority::High);
        assert!(QueuePriority::High > QueuePriority::Normal);
        assert!(QueuePriority::Normal > QueuePriority::Low);
        assert!(QueuePriority::Low > QueuePriority::Background);
    }

    #[test]
    fn test_priority_from_action() {
        assert_eq!(
            QueuePriority::from_action(SyncAction::Delete),
            QueuePriority::Critical
        );
        assert_eq!(
            QueuePriority::from_action(SyncAction::Update),
            QueuePriority::High
        );
        assert_eq!(
            QueuePriority::from_action(SyncAction::Create),
            QueuePriority::Normal
        );
    }

    #[test]
    fn test_priority_values() {
        assert_eq!(QueuePriority::Critical.value(), 8);
        assert_eq!(QueuePriority::Normal.value(), 3);
        assert_eq!(QueuePriority::from_value(5), Some(QueuePriority::High));
        assert_eq!(QueuePriority::from_value(7), None);

        // 裸数值归档
        assert_eq!(QueuePriority::from(2), QueuePriority::Low);
        assert_eq!(QueuePriority::from(6), QueuePriority::High);
        assert_eq!(QueuePriority::from(200), QueuePriority::Critical);
    }

    #[test]
    fn test_priority_helpers() {
        assert!(QueuePriority::Critical.is_high_priority());
        assert!(QueuePriority::High.is_high_priority());
        assert!(!QueuePriority::Normal.is_high_priority());

        assert!(QueuePriority::Low.is_low_priority());
        assert!(QueuePriority::Background.is_low_priority());
        assert!(!QueuePriority::Normal.is_low_priority());
    }

    #[test]
    fn test_priority_comparator() {
        assert!(PriorityComparator::is_higher(8, 5));
        assert!(PriorityComparator::is_lower(1, 3));
        // 处理顺序：高优先级排前面
        let mut values = vec![1u8, 5, 3];
        values.sort_by(|a, b| PriorityComparator::process_order(*a, *b));
        assert_eq!(values, vec![5, 3, 1]);
    }
}
