use super::limit::{
    check_memory, memory_threshold, Direction, ResourceLimit, ScopeStat,
    RESERVATION_PRIORITY_ALWAYS,
};
use crate::error::{SpError, SpResult};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Limit and usage of one scope, checked and mutated under the scope lock.
#[derive(Debug, Clone, Copy)]
struct Resources {
    limit: ResourceLimit,
    stat: ScopeStat,
}

impl Resources {
    fn exceeded(
        scope: &str,
        resource: &'static str,
        current: i64,
        attempted: i64,
        limit: i64,
    ) -> SpError {
        debug!(
            scope,
            resource, current, attempted, limit, "Resource reservation refused"
        );
        SpError::ResourceLimitExceeded {
            scope: scope.to_string(),
            resource,
            current,
            attempted,
            limit,
        }
    }

    fn reserve_memory(&mut self, scope: &str, size: i64, priority: u8) -> SpResult<()> {
        if size < 0 {
            return Err(SpError::InvalidParameters(format!(
                "cannot reserve negative memory {size} in {scope}"
            )));
        }
        if !check_memory(self.stat.memory, size, self.limit.memory, priority) {
            return Err(Self::exceeded(
                scope,
                "memory",
                self.stat.memory,
                size,
                memory_threshold(self.limit.memory, priority),
            ));
        }
        self.stat.memory += size;
        Ok(())
    }

    fn release_memory(&mut self, scope: &str, size: i64) {
        self.stat.memory -= size;
        if self.stat.memory < 0 {
            warn!(scope, "BUG: too much memory released");
            self.stat.memory = 0;
        }
    }

    fn check_conns(&self, scope: &str, inbound: i32, outbound: i32, fds: i32) -> SpResult<()> {
        let l = &self.limit;
        let s = &self.stat;
        if inbound > 0 && s.conns_inbound + inbound > l.conns_inbound {
            return Err(Self::exceeded(
                scope,
                "inbound connections",
                s.conns_inbound.into(),
                inbound.into(),
                l.conns_inbound.into(),
            ));
        }
        if outbound > 0 && s.conns_outbound + outbound > l.conns_outbound {
            return Err(Self::exceeded(
                scope,
                "outbound connections",
                s.conns_outbound.into(),
                outbound.into(),
                l.conns_outbound.into(),
            ));
        }
        if inbound + outbound > 0 && s.conns() + inbound + outbound > l.conns {
            return Err(Self::exceeded(
                scope,
                "connections",
                s.conns().into(),
                (inbound + outbound).into(),
                l.conns.into(),
            ));
        }
        if fds > 0 && s.fds + fds > l.fd {
            return Err(Self::exceeded(
                scope,
                "file descriptors",
                s.fds.into(),
                fds.into(),
                l.fd.into(),
            ));
        }
        Ok(())
    }

    fn check_tasks(&self, scope: &str, high: i32, medium: i32, low: i32) -> SpResult<()> {
        let l = &self.limit;
        let s = &self.stat;
        for (resource, current, want, limit) in [
            ("high tasks", s.tasks_high, high, l.tasks_high),
            ("medium tasks", s.tasks_medium, medium, l.tasks_medium),
            ("low tasks", s.tasks_low, low, l.tasks_low),
        ] {
            if want > 0 && current + want > limit {
                return Err(Self::exceeded(
                    scope,
                    resource,
                    current.into(),
                    want.into(),
                    limit.into(),
                ));
            }
        }
        let want = high + medium + low;
        if want > 0 && s.tasks() + want > l.tasks {
            return Err(Self::exceeded(
                scope,
                "tasks",
                s.tasks().into(),
                want.into(),
                l.tasks.into(),
            ));
        }
        Ok(())
    }

    fn add_stat(&mut self, scope: &str, st: &ScopeStat) -> SpResult<()> {
        if st.memory < 0 {
            return Err(SpError::InvalidParameters(format!(
                "cannot reserve negative memory {} in {scope}",
                st.memory
            )));
        }
        if !check_memory(
            self.stat.memory,
            st.memory,
            self.limit.memory,
            RESERVATION_PRIORITY_ALWAYS,
        ) {
            return Err(Self::exceeded(
                scope,
                "memory",
                self.stat.memory,
                st.memory,
                self.limit.memory,
            ));
        }
        self.check_conns(scope, st.conns_inbound, st.conns_outbound, st.fds)?;
        self.check_tasks(scope, st.tasks_high, st.tasks_medium, st.tasks_low)?;

        let s = &mut self.stat;
        s.memory += st.memory;
        s.fds += st.fds;
        s.conns_inbound += st.conns_inbound;
        s.conns_outbound += st.conns_outbound;
        s.tasks_high += st.tasks_high;
        s.tasks_medium += st.tasks_medium;
        s.tasks_low += st.tasks_low;
        Ok(())
    }

    fn remove_stat(&mut self, scope: &str, st: &ScopeStat) {
        fn clamp32(scope: &str, resource: &str, v: &mut i32, by: i32) {
            *v -= by;
            if *v < 0 {
                warn!(scope, resource, "BUG: too much released");
                *v = 0;
            }
        }
        self.release_memory(scope, st.memory);
        let s = &mut self.stat;
        clamp32(scope, "fds", &mut s.fds, st.fds);
        clamp32(scope, "inbound connections", &mut s.conns_inbound, st.conns_inbound);
        clamp32(scope, "outbound connections", &mut s.conns_outbound, st.conns_outbound);
        clamp32(scope, "high tasks", &mut s.tasks_high, st.tasks_high);
        clamp32(scope, "medium tasks", &mut s.tasks_medium, st.tasks_medium);
        clamp32(scope, "low tasks", &mut s.tasks_low, st.tasks_low);
    }
}

fn conn_stat(dir: Direction) -> ScopeStat {
    match dir {
        Direction::Inbound => ScopeStat {
            conns_inbound: 1,
            fds: 1,
            ..Default::default()
        },
        Direction::Outbound => ScopeStat {
            conns_outbound: 1,
            fds: 1,
            ..Default::default()
        },
    }
}

/// Limit and usage of a scope read together under its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSnapshot {
    pub name: String,
    pub limit: ResourceLimit,
    pub stat: ScopeStat,
}

impl ScopeSnapshot {
    pub fn remaining(&self) -> ResourceLimit {
        self.limit.remaining(&self.stat)
    }
}

#[derive(Debug)]
struct ScopeState {
    rc: Resources,
    refs: i32,
    done: bool,
}

/// A node in the resource DAG. Root and service scopes propagate to their
/// `edges`; spans propagate to their `owner` and everything above it.
#[derive(Debug)]
pub struct ResourceScope {
    name: String,
    owner: Option<Arc<ResourceScope>>,
    edges: Vec<Arc<ResourceScope>>,
    span_ids: AtomicI64,
    state: Mutex<ScopeState>,
}

impl ResourceScope {
    fn build(
        name: String,
        limit: ResourceLimit,
        owner: Option<Arc<ResourceScope>>,
        edges: Vec<Arc<ResourceScope>>,
    ) -> Arc<Self> {
        if let Some(owner) = &owner {
            owner.inc_ref();
        }
        for edge in &edges {
            edge.inc_ref();
        }
        Arc::new(Self {
            name,
            owner,
            edges,
            span_ids: AtomicI64::new(0),
            state: Mutex::new(ScopeState {
                rc: Resources {
                    limit,
                    stat: ScopeStat::default(),
                },
                refs: 0,
                done: false,
            }),
        })
    }

    pub fn new_root(name: impl Into<String>, limit: ResourceLimit) -> Arc<Self> {
        Self::build(name.into(), limit, None, Vec::new())
    }

    /// A DAG child whose reservations also land on every scope in `edges`.
    pub fn new_dag(
        name: impl Into<String>,
        limit: ResourceLimit,
        edges: Vec<Arc<ResourceScope>>,
    ) -> Arc<Self> {
        Self::build(name.into(), limit, None, edges)
    }

    pub(crate) fn new_span(owner: &Arc<ResourceScope>, label: Option<&str>) -> Arc<Self> {
        let id = owner.span_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let name = match label {
            Some(label) => format!("{}.span-{label}-{id}", owner.name),
            None => format!("{}.span-{id}", owner.name),
        };
        let limit = owner.limit();
        Self::build(name, limit, Some(owner.clone()), Vec::new())
    }

    fn state(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn closed(&self) -> SpError {
        SpError::ResourceScopeClosed(self.name.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> ResourceLimit {
        self.state().rc.limit
    }

    pub fn stat(&self) -> ScopeStat {
        self.state().rc.stat
    }

    /// The limit minus current usage.
    pub fn remaining(&self) -> ResourceLimit {
        let st = self.state();
        st.rc.limit.remaining(&st.rc.stat)
    }

    pub fn snapshot(&self) -> ScopeSnapshot {
        let st = self.state();
        ScopeSnapshot {
            name: self.name.clone(),
            limit: st.rc.limit,
            stat: st.rc.stat,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state().done
    }

    pub fn refs(&self) -> i32 {
        self.state().refs
    }

    fn inc_ref(&self) {
        self.state().refs += 1;
    }

    fn dec_ref(&self) {
        let mut st = self.state();
        st.refs -= 1;
        if st.refs < 0 {
            warn!(scope = %self.name, "BUG: negative scope reference count");
            st.refs = 0;
        }
    }

    pub fn begin_span(self: &Arc<Self>) -> SpResult<Arc<ResourceScope>> {
        if self.is_done() {
            return Err(self.closed());
        }
        Ok(Self::new_span(self, None))
    }

    pub fn reserve_memory(&self, size: i64, priority: u8) -> SpResult<()> {
        {
            let mut st = self.state();
            if st.done {
                return Err(self.closed());
            }
            st.rc.reserve_memory(&self.name, size, priority)?;
        }
        if let Some(owner) = &self.owner {
            if let Err(e) = owner.reserve_memory(size, priority) {
                self.state().rc.release_memory(&self.name, size);
                return Err(e);
            }
            return Ok(());
        }
        for (i, edge) in self.edges.iter().enumerate() {
            if let Err(e) = edge.reserve_memory_for_child(size, priority) {
                for prior in &self.edges[..i] {
                    prior.release_memory_for_child(size);
                }
                self.state().rc.release_memory(&self.name, size);
                return Err(e);
            }
        }
        Ok(())
    }

    fn reserve_memory_for_child(&self, size: i64, priority: u8) -> SpResult<()> {
        let mut st = self.state();
        if st.done {
            return Err(self.closed());
        }
        st.rc.reserve_memory(&self.name, size, priority)
    }

    pub fn release_memory(&self, size: i64) {
        {
            let mut st = self.state();
            if st.done {
                return;
            }
            st.rc.release_memory(&self.name, size);
        }
        if let Some(owner) = &self.owner {
            owner.release_memory(size);
            return;
        }
        for edge in &self.edges {
            edge.release_memory_for_child(size);
        }
    }

    fn release_memory_for_child(&self, size: i64) {
        let mut st = self.state();
        if st.done {
            return;
        }
        st.rc.release_memory(&self.name, size);
    }

    pub fn add_conn(&self, dir: Direction) -> SpResult<()> {
        self.reserve_resources(&conn_stat(dir))
    }

    pub fn remove_conn(&self, dir: Direction) {
        self.release_resources(&conn_stat(dir))
    }

    /// Reserves every component of `stat` at once; memory goes in at ALWAYS priority.
    pub fn reserve_resources(&self, stat: &ScopeStat) -> SpResult<()> {
        {
            let mut st = self.state();
            if st.done {
                return Err(self.closed());
            }
            st.rc.add_stat(&self.name, stat)?;
        }
        if let Some(owner) = &self.owner {
            if let Err(e) = owner.reserve_resources(stat) {
                self.state().rc.remove_stat(&self.name, stat);
                return Err(e);
            }
            return Ok(());
        }
        for (i, edge) in self.edges.iter().enumerate() {
            if let Err(e) = edge.reserve_for_child(stat) {
                for prior in &self.edges[..i] {
                    prior.release_for_child(stat);
                }
                self.state().rc.remove_stat(&self.name, stat);
                return Err(e);
            }
        }
        Ok(())
    }

    fn reserve_for_child(&self, stat: &ScopeStat) -> SpResult<()> {
        let mut st = self.state();
        if st.done {
            return Err(self.closed());
        }
        st.rc.add_stat(&self.name, stat)
    }

    pub fn release_resources(&self, stat: &ScopeStat) {
        {
            let mut st = self.state();
            if st.done {
                return;
            }
            st.rc.remove_stat(&self.name, stat);
        }
        if let Some(owner) = &self.owner {
            owner.release_resources(stat);
            return;
        }
        for edge in &self.edges {
            edge.release_for_child(stat);
        }
    }

    fn release_for_child(&self, stat: &ScopeStat) {
        let mut st = self.state();
        if st.done {
            return;
        }
        st.rc.remove_stat(&self.name, stat);
    }

    /// Closes the scope and hands everything it still holds back up the graph.
    /// Calling it twice is harmless.
    pub fn done(&self) {
        let held = {
            let mut st = self.state();
            if st.done {
                return;
            }
            st.done = true;
            std::mem::take(&mut st.rc.stat)
        };
        if let Some(owner) = &self.owner {
            owner.release_resources(&held);
            owner.dec_ref();
            return;
        }
        for edge in &self.edges {
            edge.release_for_child(&held);
            edge.dec_ref();
        }
    }
}
