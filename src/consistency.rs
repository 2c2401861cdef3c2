//! Flow-sensitive must-call consistency analysis over a method body.
//!
//! The analyzer tracks alias sets of resource-typed expressions through the
//! CFG and checks that every owning set's must-call obligations are
//! discharged on every path, normal and exceptional. The central asymmetry:
//! passing a value to an owning parameter transfers ownership only on the
//! callee's *normal* return; on the exceptional edge the caller keeps it.
//!
//! The fixpoint runs first without reporting; findings are then collected in
//! a single deterministic pass over the stabilized states, so transient
//! pre-fixpoint states never produce diagnostics and iteration order cannot
//! affect the output.

use crate::annotations::AnnotationOracle;
use crate::cfg::{BlockId, Cfg, Instr, MethodRef, ProgramPoint, Rvalue, Terminator, ThrowEdge};
use crate::config::Options;
use crate::diagnostics::{Diagnostic, REQUIRED_METHOD_NOT_CALLED};
use crate::error::Result;
use crate::hir::{ClassDecl, FieldDecl, MethodDecl, Program, TypeRef};
use crate::obligation::{ExitKind, Provenance, Resource, canonicalize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Abstract state at a program point: the live alias sets.
///
/// Kept sorted by smallest alias so that structurally equal states compare
/// equal regardless of how they were built.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct State {
    resources: Vec<Resource>,
}

impl State {
    fn normalize(&mut self) {
        self.resources
            .sort_by(|a, b| (a.aliases.first(), a.origin).cmp(&(b.aliases.first(), b.origin)));
    }

    fn find(&self, canonical: &str) -> Option<usize> {
        self.resources
            .iter()
            .position(|r| r.contains_alias(canonical))
    }

    /// Remove `canonical` as an alias everywhere, reporting a leak if that
    /// orphans an owning, undischarged set.
    fn drop_alias(&mut self, canonical: &str, point: ProgramPoint, sink: &mut Sink) {
        let Some(index) = self.find(canonical) else {
            return;
        };
        let resource = &mut self.resources[index];
        resource.remove_alias(canonical);
        if resource.aliases.is_empty() {
            let mut missing = resource.pending(ExitKind::NormalReturn);
            missing.extend(resource.pending(ExitKind::ExceptionalExit));
            if !missing.is_empty() {
                sink.leak(
                    point,
                    canonical,
                    &missing,
                    "the last reference is overwritten before the obligation is discharged",
                );
            }
            self.resources.remove(index);
        }
    }
}

/// Join of two predecessor states.
///
/// Alias-set identity is preserved where the member sets overlap; pending
/// obligations take the union, so called-sets intersect. A set present on
/// one predecessor only is treated as present with full obligations on the
/// other, which clears its called-set.
fn join(a: &State, b: &State) -> Result<State> {
    let mut resources = Vec::new();
    let mut matched = vec![false; b.resources.len()];
    for ra in &a.resources {
        let partner = b
            .resources
            .iter()
            .position(|rb| !ra.aliases.is_disjoint(&rb.aliases));
        match partner {
            Some(i) => {
                matched[i] = true;
                resources.push(ra.merge_with(&b.resources[i])?);
            }
            None => {
                let mut lone = ra.clone();
                lone.called.clear();
                resources.push(lone);
            }
        }
    }
    for (i, rb) in b.resources.iter().enumerate() {
        if !matched[i] {
            let mut lone = rb.clone();
            lone.called.clear();
            resources.push(lone);
        }
    }
    let mut state = State { resources };
    state.normalize();
    Ok(state)
}

/// Findings collected while interpreting blocks. Keyed by point and message
/// so re-interpretation is idempotent and the final order deterministic.
#[derive(Debug)]
struct Sink {
    enabled: bool,
    findings: BTreeSet<(ProgramPoint, String)>,
}

impl Sink {
    fn new(enabled: bool) -> Self {
        Sink {
            enabled,
            findings: BTreeSet::new(),
        }
    }

    fn leak(&mut self, point: ProgramPoint, alias: &str, missing: &BTreeSet<String>, why: &str) {
        if !self.enabled {
            return;
        }
        let message = format!(
            "must-call method(s) [{}] may never be called on {}: {}",
            missing.iter().cloned().collect::<Vec<_>>().join(", "),
            alias,
            why
        );
        self.findings.insert((point, message));
    }
}

/// Per-method analyzer. A fresh one is constructed for every body; it holds
/// no state across invocations.
pub struct ConsistencyAnalyzer<'p> {
    oracle: &'p AnnotationOracle<'p>,
    options: &'p Options,
    class: &'p ClassDecl,
    method: &'p MethodDecl,
}

impl<'p> ConsistencyAnalyzer<'p> {
    pub fn new(
        oracle: &'p AnnotationOracle<'p>,
        options: &'p Options,
        class: &'p ClassDecl,
        method: &'p MethodDecl,
    ) -> Self {
        Self {
            oracle,
            options,
            class,
            method,
        }
    }

    /// Analyze the method body, if it has one.
    pub fn analyze(&self) -> Result<Vec<Diagnostic>> {
        let Some(cfg) = &self.method.body else {
            return Ok(Vec::new());
        };
        cfg.validate()?;
        debug!(
            method = %Program::method_path(self.class, self.method),
            "consistency analysis"
        );

        let states = self.fixpoint(cfg)?;

        // Reporting pass over the stabilized states. Leaks are checked
        // per path, at each return and at each edge into the exceptional
        // exit, never on the merged exit state: a path that transferred
        // ownership must not be confused with one that still owes.
        let mut sink = Sink::new(true);
        for id in cfg.block_ids() {
            if let Some(state) = states.get(&id) {
                self.transfer_block(cfg, id, state.clone(), &mut sink)?;
            }
        }

        let element = Program::method_path(self.class, self.method);
        Ok(sink
            .findings
            .into_iter()
            .map(|(point, message)| {
                Diagnostic::new(&REQUIRED_METHOD_NOT_CALLED, element.clone(), message).at(point)
            })
            .collect())
    }

    /// Worklist fixpoint over block entry states. The obligation lattice is
    /// finite and the transfer functions monotone, so this terminates.
    fn fixpoint(&self, cfg: &Cfg) -> Result<BTreeMap<BlockId, State>> {
        let mut states: BTreeMap<BlockId, State> = BTreeMap::new();
        let mut initial = self.initial_state(cfg.entry);
        initial.normalize();
        states.insert(cfg.entry, initial);

        let mut worklist: BTreeSet<BlockId> = BTreeSet::new();
        worklist.insert(cfg.entry);
        let mut sink = Sink::new(false);

        while let Some(id) = worklist.pop_first() {
            // Worklist entries are only ever inserted together with a state.
            let Some(state) = states.get(&id).cloned() else {
                continue;
            };
            for (successor, mut out) in self.transfer_block(cfg, id, state, &mut sink)? {
                out.normalize();
                let merged = match states.get(&successor) {
                    Some(existing) => join(existing, &out)?,
                    None => out,
                };
                if states.get(&successor) != Some(&merged) {
                    states.insert(successor, merged);
                    worklist.insert(successor);
                }
            }
        }
        Ok(states)
    }

    /// Entry state: owning parameters are tracked with full obligations for
    /// both exit kinds; other parameters enter as borrowed sets. In a
    /// constructor the owning fields of `this` start unassigned, so nothing
    /// is tracked for the receiver itself.
    fn initial_state(&self, entry: BlockId) -> State {
        let entry_point = ProgramPoint {
            block: entry,
            index: 0,
        };
        let mut resources = Vec::new();
        for param in &self.method.params {
            let Some(must_call) = self
                .oracle
                .must_call_of(&param.ty)
                .known()
                .filter(|m| !m.is_empty())
                .cloned()
            else {
                continue;
            };
            resources.push(Resource::new(
                &param.name,
                must_call,
                self.oracle.owning_param(param),
                Provenance::Parameter,
                entry_point,
            ));
        }
        State { resources }
    }

    /// Interpret one block from its entry state, producing per-successor
    /// out-states.
    fn transfer_block(
        &self,
        cfg: &Cfg,
        id: BlockId,
        mut state: State,
        sink: &mut Sink,
    ) -> Result<Vec<(BlockId, State)>> {
        let block = cfg.block(id)?;
        for (index, instr) in block.instrs.iter().enumerate() {
            let point = ProgramPoint { block: id, index };
            let Instr::Assign { lhs, rvalue } = instr;
            self.transfer_assign(&mut state, lhs, rvalue, point, sink);
        }
        let point = ProgramPoint {
            block: id,
            index: block.instrs.len(),
        };
        self.transfer_terminator(cfg, &block.terminator, state, point, sink)
    }

    fn transfer_assign(
        &self,
        state: &mut State,
        lhs: &str,
        rvalue: &Rvalue,
        point: ProgramPoint,
        sink: &mut Sink,
    ) {
        let lhs_canonical = canonicalize(lhs);

        // Locate the source set before the overwrite removes anything.
        let source_expression = match rvalue {
            Rvalue::Use(e) => Some(canonicalize(e)),
            Rvalue::FieldRead { object, field } => Some(canonicalize(&format!("{object}.{field}"))),
            Rvalue::Alloc { .. } => None,
        };
        if source_expression.as_deref() == Some(lhs_canonical.as_str()) {
            // Self-assignment changes nothing.
            return;
        }
        let source_aliases = source_expression
            .as_deref()
            .and_then(|e| state.find(e))
            .map(|i| state.resources[i].aliases.clone());

        state.drop_alias(&lhs_canonical, point, sink);

        match (source_aliases, rvalue) {
            (Some(aliases), _) => {
                // Re-find by a surviving member: the overwrite above may
                // have shifted indices.
                let member = aliases.iter().find(|a| **a != lhs_canonical);
                if let Some(member) = member
                    && let Some(index) = state.find(member)
                {
                    state.resources[index].add_alias(&lhs_canonical);
                    self.apply_store(state, lhs, &lhs_canonical);
                }
            }
            (None, Rvalue::Alloc { ty }) => {
                if self.options.no_lightweight_ownership {
                    return;
                }
                if let Some(must_call) = self
                    .oracle
                    .must_call_of(ty)
                    .known()
                    .filter(|m| !m.is_empty())
                {
                    state.resources.push(Resource::new(
                        &lhs_canonical,
                        must_call.clone(),
                        true,
                        Provenance::Allocation,
                        point,
                    ));
                    self.apply_store(state, lhs, &lhs_canonical);
                } else {
                    trace!(ty = %ty.name, "allocation of untracked type");
                }
            }
            (None, Rvalue::FieldRead { object, field }) => {
                // Reading an untracked field creates a borrowed set so that
                // precondition and postcondition bookkeeping has a place to
                // land.
                let expression = canonicalize(&format!("{object}.{field}"));
                if let Some(must_call) = self
                    .field_decl(object, field)
                    .map(|f| self.oracle.must_call_of(&f.ty))
                    .and_then(|m| m.known().filter(|m| !m.is_empty()).cloned())
                {
                    let mut resource =
                        Resource::new(&expression, must_call, false, Provenance::FieldRead, point);
                    resource.add_alias(&lhs_canonical);
                    state.resources.push(resource);
                }
            }
            (None, Rvalue::Use(_)) => {}
        }
    }

    /// Post-assignment handling when the (raw) left-hand side is a field
    /// access. Storing into an owning field of `this` discharges differently
    /// per context: in a constructor the normal-return obligation becomes
    /// the enclosing type's problem but the exceptional one stays, because a
    /// constructor that throws leaves the half-built receiver unreachable to
    /// the caller. In an ordinary method the receiver is still reachable,
    /// so the store is a plain ownership transfer. Stores into fields of
    /// other objects transfer outright.
    fn apply_store(&self, state: &mut State, raw_lhs: &str, lhs_canonical: &str) {
        let Some((object, field)) = raw_lhs.trim().rsplit_once('.') else {
            return;
        };
        let Some(index) = state.find(lhs_canonical) else {
            return;
        };
        if object != "this" {
            state.resources[index].transfer();
            return;
        }
        let owning = self
            .class
            .find_field(field)
            .is_some_and(|f| self.oracle.owning_field(f));
        if !owning {
            return;
        }
        let resource = &mut state.resources[index];
        if self.method.is_constructor {
            resource.stored_in_field = Some(field.to_string());
            resource.exit_kinds.remove(&ExitKind::NormalReturn);
        } else {
            // Overwriting a live owning field is guarded separately by the
            // creates-must-call protocol; the store itself hands the value
            // to the receiver.
            resource.transfer();
        }
    }

    fn transfer_terminator(
        &self,
        cfg: &Cfg,
        terminator: &Terminator,
        state: State,
        point: ProgramPoint,
        sink: &mut Sink,
    ) -> Result<Vec<(BlockId, State)>> {
        match terminator {
            Terminator::Goto(target) => Ok(vec![(*target, state)]),
            Terminator::Branch {
                then_target,
                else_target,
            } => Ok(vec![(*then_target, state.clone()), (*else_target, state)]),
            Terminator::Return { value } => {
                let mut state = state;
                if let Some(value) = value
                    && self.oracle.owning_return(self.method)
                    && let Some(index) = state.find(&canonicalize(value))
                {
                    // The caller takes responsibility for the returned value.
                    state.resources[index].transfer();
                }
                self.check_pending(&state, ExitKind::NormalReturn, sink);
                Ok(vec![(cfg.normal_exit, state)])
            }
            Terminator::Throw { target, .. } => {
                // Explicit throws are analyzed regardless of the ignored
                // exception list; only callee faults are excused.
                if *target == cfg.exceptional_exit {
                    self.check_pending(&state, ExitKind::ExceptionalExit, sink);
                }
                Ok(vec![(*target, state)])
            }
            Terminator::Exit => Ok(Vec::new()),
            Terminator::Call {
                callee,
                receiver,
                args,
                dest,
                normal,
                exceptional,
            } => self.transfer_call(
                cfg,
                CallSite {
                    callee,
                    receiver: receiver.as_deref(),
                    args,
                    dest: dest.as_deref(),
                    normal: *normal,
                    exceptional,
                },
                state,
                point,
                sink,
            ),
        }
    }

    fn transfer_call(
        &self,
        cfg: &Cfg,
        site: CallSite<'_>,
        state: State,
        point: ProgramPoint,
        sink: &mut Sink,
    ) -> Result<Vec<(BlockId, State)>> {
        let declaration = self.resolve_callee(site.callee, site.args.len());

        if let Some(declaration) = declaration {
            self.check_preconditions(&state, declaration, &site, point, sink);
        }

        // Normal-return edge: the call completed.
        let mut normal_state = state.clone();
        if let Some(receiver) = site.receiver
            && let Some(index) = normal_state.find(&canonicalize(receiver))
        {
            normal_state.resources[index]
                .called
                .insert(site.callee.name.clone());
        }

        if let Some(declaration) = declaration {
            // Ownership of owning arguments transfers only here, never on
            // the exceptional edge.
            for (param, arg) in declaration.params.iter().zip(site.args) {
                if self.oracle.owning_param(param)
                    && let Some(index) = normal_state.find(&canonicalize(arg))
                {
                    normal_state.resources[index].transfer();
                }
            }
        }

        if let Some(dest) = site.dest {
            let dest_canonical = canonicalize(dest);
            normal_state.drop_alias(&dest_canonical, point, sink);
            if !self.options.no_lightweight_ownership
                && let Some(declaration) = declaration
                && self.oracle.owning_return(declaration)
                && let Some(must_call) = declaration
                    .return_ty
                    .as_ref()
                    .map(|ty| self.oracle.must_call_of(ty))
                    .and_then(|m| m.known().filter(|m| !m.is_empty()).cloned())
            {
                normal_state.resources.push(Resource::new(
                    &dest_canonical,
                    must_call,
                    true,
                    Provenance::MethodResult,
                    point,
                ));
                self.apply_store(&mut normal_state, dest, &dest_canonical);
            }
        }

        if let Some(declaration) = declaration {
            self.apply_postconditions(
                &mut normal_state,
                declaration,
                &site,
                ExitKind::NormalReturn,
                point,
            );
            self.apply_cmcf(&mut normal_state, declaration, &site, point, sink);
        }

        let mut out = vec![(site.normal, normal_state)];

        // Exceptional edges: ownership stays with the caller, the invoked
        // method is not recorded as called, and only the on-exception
        // postconditions apply.
        for edge in site.exceptional {
            if self.options.is_ignored_exception(&edge.exception) {
                trace!(exception = %edge.exception, "ignored exceptional edge");
                continue;
            }
            let mut exceptional_state = state.clone();
            if let Some(declaration) = declaration {
                self.apply_postconditions(
                    &mut exceptional_state,
                    declaration,
                    &site,
                    ExitKind::ExceptionalExit,
                    point,
                );
            }
            if edge.target == cfg.exceptional_exit {
                self.check_pending(&exceptional_state, ExitKind::ExceptionalExit, sink);
            }
            out.push((edge.target, exceptional_state));
        }

        Ok(out)
    }

    fn resolve_callee(&self, callee: &MethodRef, argc: usize) -> Option<&'p MethodDecl> {
        let class = self.oracle.program().class(&callee.on)?;
        class
            .methods
            .iter()
            .find(|m| m.name == callee.name && m.arity() == argc)
    }

    /// Each precondition method must already appear in the called-set of the
    /// target alias set on the current path. An untracked target cannot be
    /// proven and fails the check.
    fn check_preconditions(
        &self,
        state: &State,
        declaration: &MethodDecl,
        site: &CallSite<'_>,
        point: ProgramPoint,
        sink: &mut Sink,
    ) {
        for fact in self.oracle.requires_called_methods(declaration) {
            let Some(target) = self.adapt(&fact.expression, declaration, site) else {
                continue;
            };
            let called = state
                .find(&target)
                .map(|i| state.resources[i].called.clone())
                .unwrap_or_default();
            let missing: BTreeSet<String> = fact
                .methods
                .iter()
                .filter(|m| !called.contains(*m))
                .cloned()
                .collect();
            if !missing.is_empty() {
                sink.leak(
                    point,
                    &target,
                    &missing,
                    &format!("required before calling {}", declaration.name),
                );
            }
        }
    }

    /// Apply ensures facts for one exit kind as extra discharge facts.
    fn apply_postconditions(
        &self,
        state: &mut State,
        declaration: &MethodDecl,
        site: &CallSite<'_>,
        exit_kind: ExitKind,
        point: ProgramPoint,
    ) {
        for fact in self.oracle.ensures_called_methods(declaration) {
            if fact.exit_kind != exit_kind {
                continue;
            }
            let Some(target) = self.adapt(&fact.expression, declaration, site) else {
                continue;
            };
            match state.find(&target) {
                Some(index) => {
                    state.resources[index]
                        .called
                        .extend(fact.methods.iter().cloned());
                }
                None => {
                    // Materialize a borrowed set so the discharge fact
                    // survives for later precondition checks.
                    let mut resource = Resource::new(
                        &target,
                        Vec::<String>::new(),
                        false,
                        Provenance::FieldRead,
                        point,
                    );
                    resource.called.extend(fact.methods.iter().cloned());
                    state.resources.push(resource);
                }
            }
        }
    }

    /// Creates-must-call effects reinstate the target's full must-call set
    /// on the normal-return edge. The call site must be preceded by a proof
    /// that the target's existing obligations are satisfied.
    fn apply_cmcf(
        &self,
        state: &mut State,
        declaration: &MethodDecl,
        site: &CallSite<'_>,
        point: ProgramPoint,
        sink: &mut Sink,
    ) {
        for raw_target in self.oracle.creates_must_call_for(declaration) {
            let Some(target) = self.adapt(&raw_target, declaration, site) else {
                continue;
            };
            if let Some(index) = state.find(&target) {
                let pending = state.resources[index].pending(ExitKind::NormalReturn);
                if !pending.is_empty() {
                    sink.leak(
                        point,
                        &target,
                        &pending,
                        &format!(
                            "obligations must be discharged before {} re-creates them",
                            declaration.name
                        ),
                    );
                }
                state.resources[index].reinstate();
                state.resources[index].origin = point;
            } else if Some(target.as_str()) == site.receiver.map(canonicalize).as_deref() {
                // Untracked receiver: the effect still puts the caller on
                // the hook for the receiver type's must-call set.
                if let Some(must_call) = self
                    .oracle
                    .must_call_of(&TypeRef::new(site.callee.on.clone()))
                    .known()
                    .filter(|m| !m.is_empty())
                {
                    state.resources.push(Resource::new(
                        &target,
                        must_call.clone(),
                        true,
                        Provenance::MethodResult,
                        point,
                    ));
                }
            } else {
                trace!(target = %target, "creates-must-call target not tracked");
            }

            // Called-method facts recorded for expressions rooted at the
            // target (field reads, ensures facts) are stale once the
            // target's obligations are re-created.
            let prefix = format!("{target}.");
            for resource in &mut state.resources {
                if resource.aliases.iter().any(|a| a.starts_with(&prefix)) {
                    resource.called.clear();
                }
            }
        }
    }

    /// Viewpoint adaptation: bind `this`, `#N` indices, and parameter names
    /// in a declaration-side expression to call-site expressions. Returns
    /// the canonicalized caller-scope expression, or `None` when the head
    /// names a receiver or argument the call site does not have.
    fn adapt(
        &self,
        expression: &str,
        declaration: &MethodDecl,
        site: &CallSite<'_>,
    ) -> Option<String> {
        let trimmed = expression.trim();
        let (head, rest) = match trimmed.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (trimmed, None),
        };

        let bound = if head == "this" {
            canonicalize(site.receiver?)
        } else if let Some(index) = head.strip_prefix('#') {
            let index: usize = index.parse().ok()?;
            canonicalize(site.args.get(index.checked_sub(1)?)?)
        } else if let Some(position) = declaration.params.iter().position(|p| p.name == head) {
            canonicalize(site.args.get(position)?)
        } else {
            head.to_string()
        };

        Some(match rest {
            Some(rest) => canonicalize(&format!("{bound}.{rest}")),
            None => bound,
        })
    }

    /// Leak check on the path state reaching an exit of the given kind.
    fn check_pending(&self, state: &State, kind: ExitKind, sink: &mut Sink) {
        for resource in &state.resources {
            let missing = resource.pending(kind);
            if missing.is_empty() {
                continue;
            }
            let alias = resource
                .aliases
                .first()
                .cloned()
                .unwrap_or_else(|| "<expression>".to_string());
            let why = match kind {
                ExitKind::NormalReturn => "not discharged on a path to the normal return",
                ExitKind::ExceptionalExit => "not discharged on a path to the exceptional exit",
            };
            sink.leak(resource.origin, &alias, &missing, why);
        }
    }

    fn field_decl(&self, object: &str, field: &str) -> Option<&'p FieldDecl> {
        if object != "this" {
            return None;
        }
        self.oracle
            .program()
            .class(&self.class.name)
            .and_then(|c| c.find_field(field))
    }
}

/// Borrowed view of one call terminator.
struct CallSite<'a> {
    callee: &'a MethodRef,
    receiver: Option<&'a str>,
    args: &'a [String],
    dest: Option<&'a str>,
    normal: BlockId,
    exceptional: &'a [ThrowEdge],
}
