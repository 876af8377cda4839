use serde::{Deserialize, Serialize};

/// Memory reservation priorities; a reservation at priority `p` may use up to
/// `(1 + p) / 256` of the scope's memory limit.
pub const RESERVATION_PRIORITY_LOW: u8 = 101;
pub const RESERVATION_PRIORITY_MEDIUM: u8 = 152;
pub const RESERVATION_PRIORITY_HIGH: u8 = 203;
pub const RESERVATION_PRIORITY_ALWAYS: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimit {
    pub memory: i64,
    pub fd: i32,
    pub conns: i32,
    pub conns_inbound: i32,
    pub conns_outbound: i32,
    pub tasks: i32,
    pub tasks_high: i32,
    pub tasks_medium: i32,
    pub tasks_low: i32,
}

impl Default for ResourceLimit {
    fn default() -> Self {
        Self::infinite()
    }
}

impl ResourceLimit {
    pub const fn infinite() -> Self {
        Self {
            memory: i64::MAX,
            fd: i32::MAX,
            conns: i32::MAX,
            conns_inbound: i32::MAX,
            conns_outbound: i32::MAX,
            tasks: i32::MAX,
            tasks_high: i32::MAX,
            tasks_medium: i32::MAX,
            tasks_low: i32::MAX,
        }
    }

    pub const fn zero() -> Self {
        Self {
            memory: 0,
            fd: 0,
            conns: 0,
            conns_inbound: 0,
            conns_outbound: 0,
            tasks: 0,
            tasks_high: 0,
            tasks_medium: 0,
            tasks_low: 0,
        }
    }

    /// Component-wise `self >= other`.
    pub fn not_less(&self, other: &ResourceLimit) -> bool {
        self.memory >= other.memory
            && self.fd >= other.fd
            && self.conns >= other.conns
            && self.conns_inbound >= other.conns_inbound
            && self.conns_outbound >= other.conns_outbound
            && self.tasks >= other.tasks
            && self.tasks_high >= other.tasks_high
            && self.tasks_medium >= other.tasks_medium
            && self.tasks_low >= other.tasks_low
    }

    pub fn task_limit(&self, level: TaskLevel) -> i32 {
        match level {
            TaskLevel::High => self.tasks_high,
            TaskLevel::Medium => self.tasks_medium,
            TaskLevel::Low => self.tasks_low,
        }
    }

    /// What is left of this limit once `stat` is in use. Infinite components stay infinite.
    pub fn remaining(&self, stat: &ScopeStat) -> ResourceLimit {
        fn left64(limit: i64, used: i64) -> i64 {
            if limit == i64::MAX {
                return limit;
            }
            limit.saturating_sub(used).max(0)
        }
        fn left32(limit: i32, used: i32) -> i32 {
            if limit == i32::MAX {
                return limit;
            }
            limit.saturating_sub(used).max(0)
        }
        ResourceLimit {
            memory: left64(self.memory, stat.memory),
            fd: left32(self.fd, stat.fds),
            conns: left32(self.conns, stat.conns()),
            conns_inbound: left32(self.conns_inbound, stat.conns_inbound),
            conns_outbound: left32(self.conns_outbound, stat.conns_outbound),
            tasks: left32(self.tasks, stat.tasks()),
            tasks_high: left32(self.tasks_high, stat.tasks_high),
            tasks_medium: left32(self.tasks_medium, stat.tasks_medium),
            tasks_low: left32(self.tasks_low, stat.tasks_low),
        }
    }

    pub fn as_stat(&self) -> ScopeStat {
        ScopeStat {
            memory: self.memory,
            fds: self.fd,
            conns_inbound: self.conns_inbound,
            conns_outbound: self.conns_outbound,
            tasks_high: self.tasks_high,
            tasks_medium: self.tasks_medium,
            tasks_low: self.tasks_low,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStat {
    pub memory: i64,
    pub fds: i32,
    pub conns_inbound: i32,
    pub conns_outbound: i32,
    pub tasks_high: i32,
    pub tasks_medium: i32,
    pub tasks_low: i32,
}

impl ScopeStat {
    pub fn conns(&self) -> i32 {
        self.conns_inbound + self.conns_outbound
    }

    pub fn tasks(&self) -> i32 {
        self.tasks_high + self.tasks_medium + self.tasks_low
    }

    pub fn is_zero(&self) -> bool {
        *self == ScopeStat::default()
    }

    pub fn task(level: TaskLevel) -> ScopeStat {
        let mut stat = ScopeStat::default();
        match level {
            TaskLevel::High => stat.tasks_high = 1,
            TaskLevel::Medium => stat.tasks_medium = 1,
            TaskLevel::Low => stat.tasks_low = 1,
        }
        stat
    }
}

/// Largest total memory a reservation at `priority` may reach under `limit`:
/// `floor(limit * (1 + priority) / 256)`, computed wide so it cannot overflow.
pub fn memory_threshold(limit: i64, priority: u8) -> i64 {
    if limit == i64::MAX {
        return limit;
    }
    let wide = (i128::from(limit) * (1 + i128::from(priority))).div_euclid(256);
    i64::try_from(wide).unwrap_or(limit)
}

/// Whether `current + reserve` fits under the priority-scaled limit.
pub fn check_memory(current: i64, reserve: i64, limit: i64, priority: u8) -> bool {
    if reserve < 0 {
        return false;
    }
    if limit == i64::MAX {
        return true;
    }
    match current.checked_add(reserve) {
        Some(total) => total <= memory_threshold(limit, priority),
        None => false,
    }
}
