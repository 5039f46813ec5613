//! Ordered stack construction
//!
//! Filters register with ordering constraints (`before`, `after`,
//! `before_all`), channel-arg predicates, and a terminal marker. Building
//! a stack filters out registrations whose predicate fails, topologically
//! sorts the rest (lexical order of filter names breaks ties, so the
//! result is deterministic across builds), appends exactly one enabled
//! terminal filter, and runs the post-processors, each of which may
//! splice additional filters into the plan.

use crate::channel_stack::ChannelStack;
use crate::filter::Filter;
use lattice_core::args::ChannelArgs;
use lattice_core::error::{CoreResult, Status};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Number of post-processor slots
pub const NUM_POST_PROCESSOR_SLOTS: usize = 2;

/// Fixed points where post-processors may rewrite the filter plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessorSlot {
    /// Runs first, immediately after ordering
    Substitution = 0,
    /// Runs last, before sizing and allocation
    Modification = 1,
}

/// A post-processor may splice filters into the ordered plan
pub type PostProcessor = Box<dyn Fn(&mut Vec<Arc<dyn Filter>>) + Send + Sync>;

struct Predicate {
    key: String,
    default: bool,
}

struct Registration {
    filter: Arc<dyn Filter>,
    terminal: bool,
    before_all: bool,
    before: Vec<&'static str>,
    after: Vec<&'static str>,
    predicates: Vec<Predicate>,
    excluded_from_minimal: bool,
}

/// Assembles channel stacks from filter registrations
pub struct StackBuilder {
    name: Arc<str>,
    registrations: Vec<Registration>,
    post_processors: [Option<PostProcessor>; NUM_POST_PROCESSOR_SLOTS],
    requires_promises: bool,
}

impl StackBuilder {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        StackBuilder {
            name: name.into(),
            registrations: Vec::new(),
            post_processors: [None, None],
            requires_promises: false,
        }
    }

    /// Register a filter; constrain it through the returned handle
    pub fn register(&mut self, filter: Arc<dyn Filter>) -> FilterRegistration<'_> {
        self.registrations.push(Registration {
            filter,
            terminal: false,
            before_all: false,
            before: Vec::new(),
            after: Vec::new(),
            predicates: Vec::new(),
            excluded_from_minimal: false,
        });
        FilterRegistration {
            reg: self.registrations.last_mut().unwrap(),
        }
    }

    /// Install the post-processor for `slot`, replacing any previous one
    pub fn add_post_processor(&mut self, slot: PostProcessorSlot, pp: PostProcessor) {
        self.post_processors[slot as usize] = Some(pp);
    }

    /// Require every filter in the built stack to support the promise
    /// pipeline; construction fails otherwise
    pub fn requires_promises(&mut self, requires: bool) -> &mut Self {
        self.requires_promises = requires;
        self
    }

    /// Compute the ordered filter list for `args` without building
    pub fn plan(&self, args: &ChannelArgs) -> CoreResult<Vec<Arc<dyn Filter>>> {
        let minimal = args.get_bool(lattice_core::constants::ARG_MINIMAL_STACK, false);
        let enabled: Vec<&Registration> = self
            .registrations
            .iter()
            .filter(|r| !(minimal && r.excluded_from_minimal))
            .filter(|r| {
                r.predicates
                    .iter()
                    .all(|p| args.get_bool(&p.key, p.default))
            })
            .collect();
        let (terminals, stages): (Vec<_>, Vec<_>) =
            enabled.into_iter().partition(|r| r.terminal);
        if terminals.len() != 1 {
            return Err(Status::failed_precondition(format!(
                "channel stack {} requires exactly one terminal filter, found {}",
                self.name,
                terminals.len()
            )));
        }
        let mut order = topological_order(&stages)?;
        order.push(terminals[0].filter.clone());
        for pp in self.post_processors.iter().flatten() {
            pp(&mut order);
        }
        if self.requires_promises {
            for filter in &order {
                if !filter.supports_promises() {
                    return Err(Status::failed_precondition(format!(
                        "stack {} is promise-based but filter {} does not make call promises",
                        self.name,
                        filter.name()
                    )));
                }
            }
        }
        Ok(order)
    }

    /// Build a channel stack for `args`
    pub fn build(&self, args: ChannelArgs) -> CoreResult<Arc<ChannelStack>> {
        let order = self.plan(&args)?;
        ChannelStack::build(self.name.clone(), order, args)
    }
}

/// Constraint handle for one registration
pub struct FilterRegistration<'a> {
    reg: &'a mut Registration,
}

impl FilterRegistration<'_> {
    /// This filter terminates the stack; exactly one terminal filter
    /// must be enabled per build
    pub fn terminal(self) -> Self {
        self.reg.terminal = true;
        self
    }

    /// Order this filter ahead of every unconstrained filter
    pub fn before_all(self) -> Self {
        self.reg.before_all = true;
        self
    }

    /// Order this filter ahead of the named filters
    pub fn before(self, names: &[&'static str]) -> Self {
        self.reg.before.extend_from_slice(names);
        self
    }

    /// Order this filter after the named filters
    pub fn after(self, names: &[&'static str]) -> Self {
        self.reg.after.extend_from_slice(names);
        self
    }

    /// Enable this filter only when the integer channel arg `key`
    /// (defaulting to `default`) is true
    pub fn if_channel_arg(self, key: &str, default: bool) -> Self {
        self.reg.predicates.push(Predicate {
            key: key.to_string(),
            default,
        });
        self
    }

    /// Drop this filter when the channel requests the minimal stack
    pub fn excluded_from_minimal_stack(self) -> Self {
        self.reg.excluded_from_minimal = true;
        self
    }
}

/// Kahn's algorithm with lexical tie-breaking over filter names
fn topological_order(regs: &[&Registration]) -> CoreResult<Vec<Arc<dyn Filter>>> {
    let n = regs.len();
    let names: Vec<&'static str> = regs.iter().map(|r| r.filter.name()).collect();
    let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    // Two before_all filters need an explicit constraint between them or
    // there is no defensible order.
    for i in 0..n {
        if !regs[i].before_all {
            continue;
        }
        for j in (i + 1)..n {
            if !regs[j].before_all {
                continue;
            }
            let constrained = regs[i].before.contains(&names[j])
                || regs[i].after.contains(&names[j])
                || regs[j].before.contains(&names[i])
                || regs[j].after.contains(&names[i]);
            if !constrained {
                return Err(Status::failed_precondition(format!(
                    "unresolvable filter graph: {} and {} both claim the top of the stack",
                    names[i], names[j]
                )));
            }
        }
    }

    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let add_edge = |successors: &mut Vec<BTreeSet<usize>>, from: usize, to: usize| {
        if from != to {
            successors[from].insert(to);
        }
    };
    for (i, reg) in regs.iter().enumerate() {
        // constraints naming absent filters are ignored
        for name in &reg.before {
            if let Some(&j) = index.get(name) {
                add_edge(&mut successors, i, j);
            }
        }
        for name in &reg.after {
            if let Some(&j) = index.get(name) {
                add_edge(&mut successors, j, i);
            }
        }
        if reg.before_all {
            for j in 0..n {
                if j != i && !regs[j].before_all {
                    add_edge(&mut successors, i, j);
                }
            }
        }
    }

    let mut indegree = vec![0usize; n];
    for succs in &successors {
        for &j in succs {
            indegree[j] += 1;
        }
    }
    // ready set keyed by name: lexical pop order makes builds stable
    let mut ready: BTreeSet<(&str, usize)> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(|i| (names[i], i))
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(&(name, i)) = ready.iter().next() {
        ready.remove(&(name, i));
        order.push(regs[i].filter.clone());
        for &j in &successors[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.insert((names[j], j));
            }
        }
    }
    if order.len() != n {
        let stuck: Vec<&str> = (0..n)
            .filter(|&i| indegree[i] > 0)
            .map(|i| names[i])
            .collect();
        return Err(Status::failed_precondition(format!(
            "unresolvable filter graph: cycle among {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::call_stack::CallElem;
    use lattice_core::error::StatusCode;

    #[derive(Debug)]
    struct NamedFilter {
        name: &'static str,
    }

    impl Filter for NamedFilter {
        fn name(&self) -> &'static str {
            self.name
        }

        fn start_batch(&self, elem: &CallElem, batch: Batch) {
            if !elem.is_last() {
                elem.forward(batch);
            }
        }
    }

    fn named(name: &'static str) -> Arc<dyn Filter> {
        Arc::new(NamedFilter {
            name,
        })
    }

    fn plan_names(builder: &StackBuilder, args: &ChannelArgs) -> Vec<&'static str> {
        builder
            .plan(args)
            .unwrap()
            .iter()
            .map(|f| f.name())
            .collect()
    }

    #[test]
    fn test_terminal_only() {
        let mut b = StackBuilder::new("test");
        b.register(named("terminator")).terminal();
        assert_eq!(plan_names(&b, &ChannelArgs::new()), vec!["terminator"]);
    }

    #[test]
    fn test_lexical_order_without_constraints() {
        let mut b = StackBuilder::new("test");
        b.register(named("foo"));
        b.register(named("bar"));
        b.register(named("baz"));
        b.register(named("aaa")).terminal();
        assert_eq!(
            plan_names(&b, &ChannelArgs::new()),
            vec!["bar", "baz", "foo", "aaa"]
        );
    }

    #[test]
    fn test_after_constraint_applies() {
        let mut b = StackBuilder::new("test");
        b.register(named("foo"));
        b.register(named("bar")).after(&["foo"]);
        b.register(named("baz"));
        b.register(named("aaa")).terminal();
        assert_eq!(
            plan_names(&b, &ChannelArgs::new()),
            vec!["baz", "foo", "bar", "aaa"]
        );
    }

    #[test]
    fn test_before_constraint_applies() {
        let mut b = StackBuilder::new("test");
        b.register(named("foo")).before(&["bar"]);
        b.register(named("bar"));
        b.register(named("baz"));
        b.register(named("aaa")).terminal();
        assert_eq!(
            plan_names(&b, &ChannelArgs::new()),
            vec!["baz", "foo", "bar", "aaa"]
        );
    }

    #[test]
    fn test_before_all_then_constraint_chain() {
        // {A, B after A, C before_all} resolves to C, A, B
        let mut b = StackBuilder::new("test");
        b.register(named("a"));
        b.register(named("b")).after(&["a"]);
        b.register(named("c")).before_all();
        b.register(named("term")).terminal();
        assert_eq!(
            plan_names(&b, &ChannelArgs::new()),
            vec!["c", "a", "b", "term"]
        );

        // dropping before_all leaves the lexical order
        let mut b = StackBuilder::new("test");
        b.register(named("a"));
        b.register(named("b")).after(&["a"]);
        b.register(named("c"));
        b.register(named("term")).terminal();
        assert_eq!(
            plan_names(&b, &ChannelArgs::new()),
            vec!["a", "b", "c", "term"]
        );
    }

    #[test]
    fn test_order_is_deterministic_across_builds() {
        let mut b = StackBuilder::new("test");
        b.register(named("zeta")).after(&["iota"]);
        b.register(named("iota"));
        b.register(named("eta"));
        b.register(named("theta")).before(&["eta"]);
        b.register(named("term")).terminal();
        let args = ChannelArgs::new();
        let first = plan_names(&b, &args);
        for _ in 0..10 {
            assert_eq!(plan_names(&b, &args), first);
        }
    }

    #[test]
    fn test_two_before_all_without_tiebreak_fails() {
        let mut b = StackBuilder::new("test");
        b.register(named("a")).before_all();
        b.register(named("b")).before_all();
        b.register(named("term")).terminal();
        let err = b.plan(&ChannelArgs::new()).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
        assert!(err.message().contains("unresolvable"));
    }

    #[test]
    fn test_two_before_all_with_explicit_order_succeeds() {
        let mut b = StackBuilder::new("test");
        b.register(named("a")).before_all().before(&["b"]);
        b.register(named("b")).before_all();
        b.register(named("term")).terminal();
        assert_eq!(
            plan_names(&b, &ChannelArgs::new()),
            vec!["a", "b", "term"]
        );
    }

    #[test]
    fn test_cycle_fails() {
        let mut b = StackBuilder::new("test");
        b.register(named("a")).before(&["b"]);
        b.register(named("b")).before(&["a"]);
        b.register(named("term")).terminal();
        let err = b.plan(&ChannelArgs::new()).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
        assert!(err.message().contains("cycle"));
    }

    #[test]
    fn test_zero_terminals_fails() {
        let mut b = StackBuilder::new("test");
        b.register(named("foo"));
        let err = b.plan(&ChannelArgs::new()).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
    }

    #[test]
    fn test_multiple_enabled_terminals_fail() {
        let mut b = StackBuilder::new("test");
        b.register(named("t1")).terminal();
        b.register(named("t2")).terminal();
        let err = b.plan(&ChannelArgs::new()).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
    }

    #[test]
    fn test_predicates_filter_registrations() {
        let mut b = StackBuilder::new("test");
        b.register(named("foo")).if_channel_arg("foo", true);
        b.register(named("bar")).if_channel_arg("bar", false);
        b.register(named("aaa")).terminal();

        assert_eq!(plan_names(&b, &ChannelArgs::new()), vec!["foo", "aaa"]);
        assert_eq!(
            plan_names(&b, &ChannelArgs::new().set("foo", false)),
            vec!["aaa"]
        );
        assert_eq!(
            plan_names(&b, &ChannelArgs::new().set("bar", true)),
            vec!["bar", "foo", "aaa"]
        );
        assert_eq!(
            plan_names(&b, &ChannelArgs::new().set("bar", true).set("foo", false)),
            vec!["bar", "aaa"]
        );
    }

    #[test]
    fn test_predicate_gated_terminals() {
        let mut b = StackBuilder::new("test");
        b.register(named("foo"));
        b.register(named("t1")).terminal().if_channel_arg("t1", false);
        b.register(named("t2")).terminal().if_channel_arg("t2", false);

        assert!(b.plan(&ChannelArgs::new()).is_err());
        assert_eq!(
            plan_names(&b, &ChannelArgs::new().set("t1", true)),
            vec!["foo", "t1"]
        );
        assert_eq!(
            plan_names(&b, &ChannelArgs::new().set("t2", true)),
            vec!["foo", "t2"]
        );
    }

    #[test]
    fn test_post_processor_can_splice() {
        let mut b = StackBuilder::new("test");
        b.register(named("base"));
        b.register(named("term")).terminal();
        b.add_post_processor(
            PostProcessorSlot::Modification,
            Box::new(|order| {
                order.insert(
                    1,
                    Arc::new(NamedFilter {
                        name: "spliced",
                    }),
                );
            }),
        );
        assert_eq!(
            plan_names(&b, &ChannelArgs::new()),
            vec!["base", "spliced", "term"]
        );
    }

    #[test]
    fn test_requires_promises_rejects_plain_filters() {
        let mut b = StackBuilder::new("test");
        b.register(named("plain"));
        b.register(named("term")).terminal();
        b.requires_promises(true);
        let err = b.plan(&ChannelArgs::new()).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
        assert!(err.message().contains("plain"));
    }

    #[test]
    fn test_minimal_stack_drops_optional_filters() {
        let mut b = StackBuilder::new("test");
        b.register(named("essential"));
        b.register(named("optional")).excluded_from_minimal_stack();
        b.register(named("term")).terminal();
        assert_eq!(
            plan_names(&b, &ChannelArgs::new()),
            vec!["essential", "optional", "term"]
        );
        let minimal = ChannelArgs::new().set(lattice_core::constants::ARG_MINIMAL_STACK, true);
        assert_eq!(plan_names(&b, &minimal), vec!["essential", "term"]);
    }

    #[test]
    fn test_constraints_on_absent_filters_are_ignored() {
        let mut b = StackBuilder::new("test");
        b.register(named("foo")).after(&["nonexistent"]);
        b.register(named("term")).terminal();
        assert_eq!(plan_names(&b, &ChannelArgs::new()), vec!["foo", "term"]);
    }
}
