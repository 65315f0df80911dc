use crate::{
    Blackboard, ComponentHandle, EvalContext, Evaluator, ExprEvaluator,
    FieldWrite, Frame, LaneId, LaneStack, LookupHandle, Node, NodeId, Program,
    QueryRequest, QueryStatus, QuerySystem, TraceEvent, TraceEventKind,
    TraceSink, ValueType, WaitUntil,
};


#[derive(Debug, Clone, Copy)]
pub struct AgentCreateInfo {
    /// Initial size of the shared frame arena.
    pub frame_capacity: usize,
    /// Frames added to the arena when a lane runs into its successor.
    pub lane_block: usize,
}

impl Default for AgentCreateInfo {
    fn default() -> Self {
        Self {
            frame_capacity: 32,
            lane_block: 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InterpreterSettings {
    /// Node steps allowed per tick before the interpreter gives up.
    pub max_cycles: u32,
}

impl Default for InterpreterSettings {
    fn default() -> Self {
        Self { max_cycles: 10_000 }
    }
}

/// Execution state of one agent. Lanes are created lazily on the first
/// tick.
#[derive(Debug, Clone)]
pub struct AgentState {
    lanes: LaneStack,
    query_holder: Option<QueryRequest>,
    next_lane_id: u32,
}

impl AgentState {
    #[must_use]
    pub fn new(info: &AgentCreateInfo) -> Self {
        Self {
            lanes: LaneStack::new(info.frame_capacity, info.lane_block),
            query_holder: None,
            next_lane_id: 0,
        }
    }

    #[must_use]
    pub fn lanes(&self) -> &LaneStack {
        &self.lanes
    }

    /// The query currently in flight for this agent, if any.
    #[must_use]
    pub fn query_holder(&self) -> Option<QueryRequest> {
        self.query_holder
    }

    fn fresh_lane_id(&mut self) -> LaneId {
        let id = LaneId(self.next_lane_id);
        self.next_lane_id += 1;
        id
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new(&AgentCreateInfo::default())
    }
}

/// Everything outside the agent state that one tick reads or mutates.
pub struct Tick<'a, 'd> {
    /// One handle per entry of [`Program::types`], in the same order.
    pub components: &'a mut [ComponentHandle<'d>],
    pub lookups: &'a [LookupHandle<'d>],
    pub blackboard: &'a mut Blackboard,
    pub queries: &'a mut dyn QuerySystem,
    pub now: f64,
    pub trace: Option<&'a mut dyn TraceSink>,
}

/// Runs a program for any number of agents.
pub struct Interpreter<'p, E = ExprEvaluator> {
    program: &'p Program,
    evaluator: E,
    settings: InterpreterSettings,
}

impl<'p> Interpreter<'p> {
    #[must_use]
    pub fn new(program: &'p Program) -> Self {
        Self::with_evaluator(
            program,
            ExprEvaluator,
            InterpreterSettings::default(),
        )
    }
}

impl<'p, E: Evaluator> Interpreter<'p, E> {
    #[must_use]
    pub fn with_evaluator(
        program: &'p Program,
        evaluator: E,
        settings: InterpreterSettings,
    ) -> Self {
        debug_assert_eq!(program.validate(), Ok(()));
        Self {
            program,
            evaluator,
            settings,
        }
    }

    #[must_use]
    pub fn program(&self) -> &'p Program {
        self.program
    }

    /// Advances `agent` by one tick.
    ///
    /// # Panics
    ///
    /// When the component or lookup handles do not match the program's
    /// type lists, the blackboard is too small, or the tick needs more than
    /// `max_cycles` steps. All of these point at a bug in the caller or the
    /// compiler.
    pub fn execute(&self, agent: &mut AgentState, tick: Tick<'_, '_>) {
        check_tick(self.program, &tick);

        let mut run = Run {
            program: self.program,
            evaluator: &self.evaluator,
            agent,
            tick,
            max_cycles: self.settings.max_cycles,
            cycle: 0,
        };
        run.run();

        if cfg!(debug_assertions) {
            run.agent.lanes.check_invariants();
        }
    }
}

/// Runs one tick of `program` with the default evaluator and settings.
pub fn execute(
    program: &Program,
    agent: &mut AgentState,
    tick: Tick<'_, '_>,
) {
    Interpreter::new(program).execute(agent, tick);
}

fn check_tick(program: &Program, tick: &Tick<'_, '_>) {
    let components: &[ComponentHandle<'_>] = &*tick.components;
    assert_eq!(
        components.len(),
        program.types().len(),
        "expected one component handle per program type"
    );
    for (handle, ty) in components.iter().zip(program.types()) {
        assert_eq!(
            handle.type_id, ty.id,
            "component handle does not match type {}",
            ty.name
        );
        assert!(
            handle.data.len() >= ty.size as usize,
            "component {} needs {} bytes, handle has {}",
            ty.name,
            ty.size,
            handle.data.len()
        );
    }

    assert!(
        tick.lookups.len() >= program.lookups().len(),
        "expected {} lookup handles, got {}",
        program.lookups().len(),
        tick.lookups.len()
    );
    for (handle, ty) in tick.lookups.iter().zip(program.lookups()) {
        let Some(ty) = ty else { continue };
        assert_eq!(
            handle.type_id, ty.id,
            "lookup handle does not match type {}",
            ty.name
        );
        assert!(
            handle.data.len() >= ty.size as usize,
            "lookup {} needs {} bytes, handle has {}",
            ty.name,
            ty.size,
            handle.data.len()
        );
    }

    let needed = program.blackboard_size() as usize;
    assert!(
        tick.blackboard.as_bytes().len() >= needed,
        "blackboard needs {needed} bytes, has {}",
        tick.blackboard.as_bytes().len()
    );
}

enum Step {
    Continue,
    Suspend,
}

struct Run<'r, 'a, 'd, E> {
    program: &'r Program,
    evaluator: &'r E,
    agent: &'r mut AgentState,
    tick: Tick<'a, 'd>,
    max_cycles: u32,
    cycle: u32,
}

impl<E: Evaluator> Run<'_, '_, '_, E> {
    fn run(&mut self) {
        if self.agent.lanes.is_empty() {
            let id = self.agent.fresh_lane_id();
            self.agent.lanes.create_primary(NodeId::ROOT, id);
        }

        // lanes spawned during this tick get their turn in it as well
        let mut lane = 0;
        while lane < self.agent.lanes.len() {
            self.run_lane(lane);
            lane += 1;
        }
    }

    fn run_lane(&mut self, lane: usize) {
        let root = self.agent.lanes.frames(lane)[0].node;
        self.emit(lane, root, TraceEventKind::Start);

        let mut root_visited = false;
        loop {
            self.cycle += 1;
            if self.cycle > self.max_cycles {
                panic!(
                    "tick exceeded {} cycles, the program does not yield",
                    self.max_cycles
                );
            }
            if let Step::Suspend = self.step(lane, &mut root_visited) {
                return;
            }
        }
    }

    fn step(&mut self, lane: usize, root_visited: &mut bool) -> Step {
        let Some(frame) = self.agent.lanes.top(lane) else {
            panic!("lane {lane} has no frames");
        };
        let program = self.program;
        let id = frame.node;
        let lane_root = self.agent.lanes.depth(lane) == 1;

        match program.node(id) {
            Node::Nop => self.finish(lane, id),
            Node::Root { child } | Node::ThreadRoot { child, .. }
                if lane_root =>
            {
                let once = matches!(
                    program.node(id),
                    Node::ThreadRoot { looping: false, .. }
                );
                if *root_visited || (once && frame.child_index > 0) {
                    self.emit(lane, id, TraceEventKind::Yield);
                    return Step::Suspend;
                }
                *root_visited = true;
                self.set_child_index(lane, 1);
                self.call(lane, id, *child)
            }
            Node::Root { child }
            | Node::ThreadRoot { child, .. }
            | Node::Catch { child } => {
                if frame.child_index == 0 {
                    self.set_child_index(lane, 1);
                    self.call(lane, id, *child)
                } else {
                    self.finish(lane, id)
                }
            }
            Node::Sequence { children } => {
                match children.get(frame.child_index as usize) {
                    Some(&child) => {
                        self.set_child_index(lane, frame.child_index + 1);
                        self.call(lane, id, child)
                    }
                    None => self.finish(lane, id),
                }
            }
            Node::Selector { branches } => {
                if frame.child_index > 0 {
                    return self.finish(lane, id);
                }
                let chosen = branches.iter().position(|b| {
                    self.evaluator.evaluate_bool(b.guard, &self.eval_context())
                });
                match chosen {
                    Some(index) => {
                        self.set_child_index(lane, index as u16 + 1);
                        self.call(lane, id, branches[index].child)
                    }
                    None => self.fail(lane, id),
                }
            }
            Node::WriteField { component, fields } => {
                for field in fields.iter() {
                    self.write_field(*component, field);
                }
                self.finish(lane, id)
            }
            Node::Wait { until } => {
                if frame.child_index == 0 {
                    self.set_child_index(lane, 1);
                    self.agent.lanes.lane_mut(lane).wait_start = self.tick.now;
                }
                let ctx = self.eval_context();
                let done = match *until {
                    WaitUntil::Duration(expr) => {
                        let duration = self.evaluator.evaluate_f32(expr, &ctx);
                        let start = self.agent.lanes.lane(lane).wait_start;
                        self.tick.now - start > f64::from(duration)
                    }
                    WaitUntil::Condition(expr) => {
                        self.evaluator.evaluate_bool(expr, &ctx)
                    }
                };
                if done {
                    self.finish(lane, id)
                } else {
                    self.emit(lane, id, TraceEventKind::Wait);
                    Step::Suspend
                }
            }
            Node::Fail => self.fail(lane, id),
            Node::Optional { guard, child } => {
                if frame.child_index > 0 {
                    return self.finish(lane, id);
                }
                if self.evaluator.evaluate_bool(*guard, &self.eval_context()) {
                    self.set_child_index(lane, 1);
                    self.call(lane, id, *child)
                } else {
                    self.finish(lane, id)
                }
            }
            Node::WriteVar { slot, value } => {
                let mut scratch = [0u8; 8];
                let bytes = &mut scratch[..slot.length()];
                self.evaluator.evaluate(*value, &self.eval_context(), bytes);
                self.tick.blackboard.as_bytes_mut()[slot.range()]
                    .copy_from_slice(bytes);
                self.finish(lane, id)
            }
            Node::Query { query, result } => {
                let request = QueryRequest {
                    query: *query,
                    lane: self.agent.lanes.lane(lane).id,
                };
                match self.agent.query_holder {
                    Some(holder) if holder != request => {
                        self.emit(lane, id, TraceEventKind::Wait);
                        return Step::Suspend;
                    }
                    Some(_) => {}
                    None => {
                        self.agent.query_holder = Some(request);
                        self.set_child_index(lane, 1);
                        self.tick.queries.submit(request);
                    }
                }
                match self.tick.queries.poll(request) {
                    QueryStatus::Complete(count) => {
                        let board = &mut *self.tick.blackboard;
                        match result.ty {
                            ValueType::Bool => {
                                board.set_bool(*result, count > 0);
                            }
                            ValueType::Int => {
                                let count =
                                    i32::try_from(count).unwrap_or(i32::MAX);
                                board.set_int(*result, count);
                            }
                            ValueType::Float => {
                                board.set_float(*result, count as f32);
                            }
                        }
                        self.agent.query_holder = None;
                        self.finish(lane, id)
                    }
                    QueryStatus::Pending => {
                        self.emit(lane, id, TraceEventKind::Wait);
                        Step::Suspend
                    }
                }
            }
            Node::Parallel { main, thread } => {
                if frame.child_index == 0 {
                    self.set_child_index(lane, 1);
                    let spawned = self.agent.fresh_lane_id();
                    let index = self.agent.lanes.spawn(lane, *thread, spawned);
                    log::trace!("{id} spawned lane {spawned} at {index}");
                    let depth = self.agent.lanes.depth(lane);
                    self.emit_raw(id, TraceEventKind::Spawn, spawned, depth);
                    self.call(lane, id, *main)
                } else {
                    let owned = self.agent.lanes.find_owned(lane, *thread);
                    if let Some(owned) = owned {
                        self.abort(lane, id, owned);
                    }
                    self.finish(lane, id)
                }
            }
        }
    }

    fn eval_context(&self) -> EvalContext<'_> {
        EvalContext {
            expressions: self.program.expressions(),
            components: &*self.tick.components,
            lookups: self.tick.lookups,
            blackboard: self.tick.blackboard.as_bytes(),
            now: self.tick.now,
        }
    }

    fn write_field(&mut self, component: u16, field: &FieldWrite) {
        let mut scratch = [0u8; 8];
        let bytes = &mut scratch[..field.length as usize];
        self.evaluator.evaluate(field.value, &self.eval_context(), bytes);
        let start = field.offset as usize;
        let data = &mut *self.tick.components[component as usize].data;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn set_child_index(&mut self, lane: usize, child_index: u16) {
        if let Some(frame) = self.agent.lanes.top_mut(lane) {
            frame.child_index = child_index;
        }
    }

    fn call(&mut self, lane: usize, caller: NodeId, child: NodeId) -> Step {
        self.emit(lane, caller, TraceEventKind::Call);
        self.agent.lanes.push(lane, Frame::new(child));
        Step::Continue
    }

    fn finish(&mut self, lane: usize, node: NodeId) -> Step {
        self.emit(lane, node, TraceEventKind::Return);
        self.agent.lanes.pop(lane);
        Step::Continue
    }

    /// Unwinds `lane` to the nearest catch in progress. Without one the
    /// whole agent starts over from the root.
    fn fail(&mut self, lane: usize, node: NodeId) -> Step {
        let program = self.program;
        self.emit(lane, node, TraceEventKind::Fail);
        self.agent.lanes.pop(lane);

        while let Some(frame) = self.agent.lanes.top(lane) {
            match program.node(frame.node) {
                Node::Catch { .. } if frame.child_index > 0 => {
                    self.emit(lane, frame.node, TraceEventKind::Catch);
                    self.agent.lanes.pop(lane);
                    return Step::Continue;
                }
                Node::Parallel { thread, .. } if frame.child_index > 0 => {
                    let owned = self.agent.lanes.find_owned(lane, *thread);
                    if let Some(owned) = owned {
                        self.abort(lane, frame.node, owned);
                    }
                }
                _ => {}
            }
            self.agent.lanes.pop(lane);
        }

        self.reset(lane)
    }

    fn reset(&mut self, lane: usize) -> Step {
        log::debug!(
            "uncaught failure in lane {}, restarting agent from root",
            self.agent.lanes.lane(lane).id
        );
        if let Some(request) = self.agent.query_holder.take() {
            self.tick.queries.cancel(request);
        }
        self.agent.lanes.reset();
        let id = self.agent.fresh_lane_id();
        self.agent.lanes.create_primary(NodeId::ROOT, id);

        // A failure in the primary lane restarts from the root within this
        // tick. A failure in a spawned lane happens after lane 0 already ran,
        // so the fresh primary lane first runs on the next tick.
        if lane == 0 {
            Step::Continue
        } else {
            Step::Suspend
        }
    }

    fn abort(&mut self, lane: usize, node: NodeId, owned: usize) {
        let depth = self.agent.lanes.depth(lane);
        for removed in self.agent.lanes.abort(owned) {
            if let Some(request) = self.agent.query_holder {
                if request.lane == removed.id {
                    self.agent.query_holder = None;
                    self.tick.queries.cancel(request);
                }
            }
            self.emit_raw(node, TraceEventKind::Abort, removed.id, depth);
        }
    }

    fn emit(&mut self, lane: usize, node: NodeId, event: TraceEventKind) {
        let l = self.agent.lanes.lane(lane);
        let (id, depth) = (l.id, l.frame_count);
        self.emit_raw(node, event, id, depth);
    }

    fn emit_raw(
        &mut self,
        node: NodeId,
        event: TraceEventKind,
        lane: LaneId,
        depth: usize,
    ) {
        if let Some(trace) = self.tick.trace.as_deref_mut() {
            trace.event(TraceEvent {
                node,
                kind: self.program.node(node).kind(),
                event,
                lane,
                depth,
                cycle: self.cycle,
            });
        }
    }
}
