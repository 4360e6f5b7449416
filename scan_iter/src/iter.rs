//! The step iterator: drives nested loops depth-first, honoring the
//! planner's evaluation order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use data_types::Value;
use expression::Env;
use rayon::prelude::*;

use crate::feedback::FeedbackPipes;
use crate::loops::{FilterFn, FunctionDef, Kwds, LoopSource, LoopSpec};
use crate::optimizer::Optimizer;
use crate::plan::{self, ScanPlan};
use crate::{Error, Result};

/// Everything a scan iteration binds, plus where it sits in the scan.
#[derive(Debug, Clone)]
pub struct StepStatus {
    /// Monotone counter over yielded steps.
    pub iteration: usize,
    /// Cartesian position, one entry per loop level.
    pub pos: Vec<usize>,
    /// Per-level yielded-iteration counters; entry `j` resets to 0 when a
    /// level above `j` advanced. Used to tell slow-axis from fast-axis.
    pub index: Vec<usize>,
    /// All bound variables at this step.
    pub kwds: Kwds,
    /// Names first bound at each level.
    pub vars: Vec<Vec<String>>,
    /// Length of the position prefix shared with the previous yielded step.
    pub unchanged: usize,
    pipes: FeedbackPipes,
}

impl StepStatus {
    /// Post optimizer feedback for `keys`, using the step's own bound
    /// values as the suggested coordinate.
    pub fn feedback(&self, keys: &[&str], observed: Value) {
        let suggested = keys
            .iter()
            .filter_map(|k| self.kwds.get(*k).cloned())
            .collect();
        self.pipes.send(keys, suggested, observed);
    }

    /// Post optimizer feedback with an explicit suggested coordinate.
    pub fn feedback_with(&self, keys: &[&str], suggested: Vec<Value>, observed: Value) {
        self.pipes.send(keys, suggested, observed);
    }
}

/// Position bookkeeping attached to `Begin`/`End` markers.
#[derive(Debug, Clone)]
pub struct LevelInfo {
    /// The loop level being entered or left.
    pub level: usize,
    /// Iteration counter of the last yielded step.
    pub iteration: usize,
    /// Cartesian position down to this level.
    pub pos: Vec<usize>,
    /// Variables bound when the marker fired.
    pub kwds: Kwds,
    /// Names first bound at each level so far.
    pub vars: Vec<Vec<String>>,
}

/// One emission of the scan iterator.
#[derive(Debug)]
pub enum ScanStep {
    /// Entering one iteration's body at a level (only with level markers).
    Begin(LevelInfo),
    /// A real, unfiltered step.
    Step(StepStatus),
    /// Leaving one iteration's body at a level (only with level markers).
    End(LevelInfo),
}

impl ScanStep {
    /// The variable bag of any variant.
    pub fn kwds(&self) -> &Kwds {
        match self {
            Self::Begin(info) | Self::End(info) => &info.kwds,
            Self::Step(s) => &s.kwds,
        }
    }
}

/// Declarative input of [`scan_iters`].
#[derive(Default)]
pub struct ScanConfig {
    /// Nesting levels, outermost first.
    pub loops: Vec<LoopSpec>,
    /// Derived variables.
    pub functions: BTreeMap<String, FunctionDef>,
    /// Names bound before the scan starts.
    pub constants: Kwds,
    /// Step predicate; rejected steps advance the position silently.
    pub filter: Option<FilterFn>,
    /// Emit `Begin`/`End` markers around every iteration body.
    pub level_marker: bool,
    /// Evaluate independent ready-group members on this pool.
    pub pool: Option<Arc<rayon::ThreadPool>>,
}

impl std::fmt::Debug for ScanConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanConfig")
            .field("loops", &self.loops)
            .field("functions", &self.functions)
            .field("constants", &self.constants.len())
            .field("filter", &self.filter.is_some())
            .field("level_marker", &self.level_marker)
            .finish()
    }
}

/// Plan the scan and return its lazy step sequence.
///
/// Planning errors (dependency cycles) surface here, before any step is
/// produced; runtime errors (a generator failing, an expression dividing
/// by zero) surface as `Err` items and end the iteration.
pub fn scan_iters(config: ScanConfig) -> Result<ScanIter> {
    let plan = plan::build(&config.loops, &config.functions, &config.constants)?;
    Ok(ScanIter {
        loops: config.loops,
        functions: config.functions,
        constants: config.constants,
        filter: config.filter,
        level_marker: config.level_marker,
        pool: config.pool,
        plan,
        pipes: FeedbackPipes::new(),
        stack: vec![],
        pending: VecDeque::new(),
        started: false,
        finished: false,
        failed: false,
        iteration: 0,
        last_iteration: 0,
        last_pos: None,
        last_index: vec![],
    })
}

enum EntryIter {
    Seq(std::vec::IntoIter<Value>),
    Gen(Box<dyn Iterator<Item = Value> + Send>),
    Opt(Box<dyn Optimizer>),
}

struct ActiveEntry {
    keys: Vec<String>,
    iter: EntryIter,
}

/// One iteration body in flight at some level.
struct Active {
    kwds: Kwds,
    vars: Vec<Vec<String>>,
    pos: Vec<usize>,
}

struct Frame {
    level: usize,
    entries: Vec<ActiveEntry>,
    limit: Option<usize>,
    i: usize,
    kwds: Kwds,
    vars: Vec<Vec<String>>,
    pos: Vec<usize>,
    active: Option<Active>,
}

/// Lazy scan step sequence; see [`scan_iters`].
pub struct ScanIter {
    loops: Vec<LoopSpec>,
    functions: BTreeMap<String, FunctionDef>,
    constants: Kwds,
    filter: Option<FilterFn>,
    level_marker: bool,
    pool: Option<Arc<rayon::ThreadPool>>,
    plan: ScanPlan,
    pipes: FeedbackPipes,
    stack: Vec<Frame>,
    pending: VecDeque<ScanStep>,
    started: bool,
    finished: bool,
    failed: bool,
    iteration: usize,
    last_iteration: usize,
    last_pos: Option<Vec<usize>>,
    last_index: Vec<usize>,
}

impl std::fmt::Debug for ScanIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanIter")
            .field("levels", &self.loops.len())
            .field("iteration", &self.iteration)
            .field("depth", &self.stack.len())
            .finish()
    }
}

impl ScanIter {
    /// The planner output backing this iterator.
    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    /// The feedback registry, for consumers that hold steps across
    /// `next()` calls.
    pub fn pipes(&self) -> FeedbackPipes {
        self.pipes.clone()
    }

    fn open_level(&mut self, level: usize, kwds: Kwds, vars: Vec<Vec<String>>) -> Result<()> {
        let spec = self.loops[level].clone();
        let mut entries = Vec::with_capacity(spec.entries.len());
        let mut limit: Option<usize> = None;
        let pos = self
            .stack
            .last()
            .and_then(|f| f.active.as_ref())
            .map(|a| a.pos.clone())
            .unwrap_or_default();

        for entry in spec.entries {
            let iter = match entry.source {
                LoopSource::Values(v) => EntryIter::Seq(v.into_iter()),
                LoopSource::Expr(e) => {
                    let env = Env::with_variables(kwds.clone());
                    let v = e.value(&env).map_err(|source| Error::Expression {
                        name: entry.keys.join(","),
                        source,
                    })?;
                    match v {
                        Value::Array(a) => {
                            let items: Vec<Value> = a.outer_iter().collect();
                            EntryIter::Seq(items.into_iter())
                        }
                        _ => {
                            return Err(Error::LoopNotIterable {
                                keys: entry.keys.clone(),
                            })
                        }
                    }
                }
                LoopSource::Generator { f, .. } => {
                    let it = f(&kwds).map_err(|source| Error::Generator {
                        keys: entry.keys.clone(),
                        source,
                    })?;
                    EntryIter::Gen(it)
                }
                LoopSource::Optimizer(cfg) => {
                    limit = Some(limit.map_or(cfg.maxiter, |l| l.min(cfg.maxiter)));
                    EntryIter::Opt((cfg.factory)(&cfg.dimensions))
                }
            };
            self.pipes.register(entry.keys.clone());
            entries.push(ActiveEntry {
                keys: entry.keys,
                iter,
            });
        }

        self.stack.push(Frame {
            level,
            entries,
            limit,
            i: 0,
            kwds,
            vars,
            pos,
            active: None,
        });
        Ok(())
    }

    fn eval_functions(&self, level: i64, kwds: &mut Kwds) -> Result<Vec<String>> {
        let mut evaluated = vec![];
        for group in self.plan.groups_at(level) {
            let todo: Vec<&String> = group.iter().filter(|n| !kwds.contains_key(*n)).collect();
            if todo.is_empty() {
                continue;
            }
            if let Some(pool) = self.pool.as_ref().filter(|_| todo.len() > 1) {
                let functions = &self.functions;
                let frozen = &*kwds;
                let results: Vec<(String, Result<Value>)> = pool.install(|| {
                    todo.par_iter()
                        .map(|name| ((*name).clone(), eval_one(functions, name.as_str(), frozen)))
                        .collect()
                });
                for (name, result) in results {
                    kwds.insert(name.clone(), result?);
                    evaluated.push(name);
                }
            } else {
                for name in todo {
                    let v = eval_one(&self.functions, name, kwds)?;
                    kwds.insert(name.clone(), v);
                    evaluated.push(name.clone());
                }
            }
        }
        Ok(evaluated)
    }

    fn bookkeep(&mut self, pos: &[usize]) -> (Vec<usize>, usize) {
        let (index, unchanged) = match &self.last_pos {
            None => (vec![0; pos.len()], 0),
            Some(last) => {
                let mut i = 0;
                while i < last.len().min(pos.len()) && last[i] == pos[i] {
                    i += 1;
                }
                let i = i.min(pos.len().saturating_sub(1));
                let mut index = vec![0; pos.len()];
                for (j, slot) in index.iter_mut().enumerate() {
                    let n = self.last_index.get(j).copied().unwrap_or(0);
                    *slot = match j.cmp(&i) {
                        std::cmp::Ordering::Less => n,
                        std::cmp::Ordering::Equal => n + 1,
                        std::cmp::Ordering::Greater => 0,
                    };
                }
                (index, i)
            }
        };
        self.last_pos = Some(pos.to_vec());
        self.last_index = index.clone();
        (index, unchanged)
    }

    fn advance(&mut self) -> Result<Option<ScanStep>> {
        loop {
            if let Some(step) = self.pending.pop_front() {
                return Ok(Some(step));
            }
            if self.finished {
                return Ok(None);
            }
            if !self.started {
                self.started = true;
                let mut kwds = self.constants.clone();
                self.eval_functions(-1, &mut kwds)?;
                if self.loops.is_empty() {
                    self.finished = true;
                    return Ok(None);
                }
                self.open_level(0, kwds, vec![])?;
                continue;
            }
            let Some(top) = self.stack.len().checked_sub(1) else {
                self.finished = true;
                return Ok(None);
            };

            // a body just completed at the top frame: feedback, End, next i
            if self.stack[top].active.is_some() {
                let frame = &mut self.stack[top];
                let active = frame.active.take().expect("checked above");
                deliver_feedback(&self.pipes, frame);
                frame.i += 1;
                if self.level_marker {
                    self.pending.push_back(ScanStep::End(LevelInfo {
                        level: frame.level,
                        iteration: self.last_iteration,
                        pos: active.pos,
                        kwds: active.kwds,
                        vars: active.vars,
                    }));
                }
                continue;
            }

            match generate_kw(&mut self.stack[top])? {
                None => {
                    self.stack.pop();
                    if self.stack.is_empty() {
                        self.finished = true;
                    }
                    continue;
                }
                Some(kw) => {
                    let (level, mut body, frame_vars, mut pos, i) = {
                        let frame = &self.stack[top];
                        (
                            frame.level,
                            frame.kwds.clone(),
                            frame.vars.clone(),
                            frame.pos.clone(),
                            frame.i,
                        )
                    };
                    let bound: Vec<String> = kw.iter().map(|(k, _)| k.clone()).collect();
                    for (k, v) in kw {
                        body.insert(k, v);
                    }
                    let local = self.eval_functions(level as i64, &mut body)?;

                    let mut level_vars = bound;
                    level_vars.extend(local);
                    let mut vars = frame_vars;
                    vars.push(level_vars);
                    pos.push(i);

                    self.stack[top].active = Some(Active {
                        kwds: body.clone(),
                        vars: vars.clone(),
                        pos: pos.clone(),
                    });
                    if self.level_marker {
                        self.pending.push_back(ScanStep::Begin(LevelInfo {
                            level,
                            iteration: self.last_iteration,
                            pos: pos.clone(),
                            kwds: body.clone(),
                            vars: vars.clone(),
                        }));
                    }

                    if level + 1 == self.loops.len() {
                        let pass = self.filter.as_ref().map_or(true, |f| f(&body));
                        if pass {
                            let (index, unchanged) = self.bookkeep(&pos);
                            self.last_iteration = self.iteration;
                            let step = StepStatus {
                                iteration: self.iteration,
                                pos,
                                index,
                                kwds: body,
                                vars,
                                unchanged,
                                pipes: self.pipes.clone(),
                            };
                            self.iteration += 1;
                            self.pending.push_back(ScanStep::Step(step));
                        }
                    } else {
                        self.open_level(level + 1, body, vars)?;
                    }
                    continue;
                }
            }
        }
    }
}

impl Iterator for ScanIter {
    type Item = Result<ScanStep>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(step) => step.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn eval_one(functions: &BTreeMap<String, FunctionDef>, name: &str, kwds: &Kwds) -> Result<Value> {
    match functions.get(name) {
        Some(FunctionDef::Expr(e)) => {
            let env = Env::with_variables(kwds.clone());
            e.value(&env).map_err(|source| Error::Expression {
                name: name.to_string(),
                source,
            })
        }
        Some(FunctionDef::Callable { f, .. }) => f(kwds).map_err(|source| Error::UserFunction {
            name: name.to_string(),
            source,
        }),
        None => unreachable!("planner only schedules declared functions"),
    }
}

fn unpack(keys: &[String], v: Value) -> Result<Vec<Value>> {
    if keys.len() == 1 {
        return Ok(vec![v]);
    }
    match v {
        Value::Array(a) if a.outer_len() == keys.len() => Ok(a.outer_iter().collect()),
        Value::Array(a) => Err(Error::KeyArity {
            keys: keys.to_vec(),
            expected: keys.len(),
            got: a.outer_len(),
        }),
        _ => Err(Error::KeyArity {
            keys: keys.to_vec(),
            expected: keys.len(),
            got: 1,
        }),
    }
}

fn generate_kw(frame: &mut Frame) -> Result<Option<Vec<(String, Value)>>> {
    if frame.limit.map_or(false, |l| frame.i >= l) {
        return Ok(None);
    }
    let mut kw = vec![];
    for entry in &mut frame.entries {
        let vals = match &mut entry.iter {
            EntryIter::Seq(it) => match it.next() {
                None => return Ok(None),
                Some(v) => unpack(&entry.keys, v)?,
            },
            EntryIter::Gen(it) => match it.next() {
                None => return Ok(None),
                Some(v) => unpack(&entry.keys, v)?,
            },
            EntryIter::Opt(opt) => {
                let vals = if frame.limit == Some(frame.i + 1) {
                    opt.get_result().x
                } else {
                    opt.ask()
                };
                if vals.len() != entry.keys.len() {
                    return Err(Error::KeyArity {
                        keys: entry.keys.clone(),
                        expected: entry.keys.len(),
                        got: vals.len(),
                    });
                }
                vals
            }
        };
        kw.extend(entry.keys.iter().cloned().zip(vals));
    }
    Ok(Some(kw))
}

fn deliver_feedback(pipes: &FeedbackPipes, frame: &mut Frame) {
    for entry in &mut frame.entries {
        if let EntryIter::Opt(opt) = &mut entry.iter {
            for (suggested, observed) in pipes.drain(&entry.keys) {
                opt.tell(suggested, observed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loops::LoopSpec;
    use crate::optimizer::{Dimension, OptimizeResult, OptimizerConfig};
    use assert_matches::assert_matches;
    use expression::Expr;

    fn steps(config: ScanConfig) -> Vec<StepStatus> {
        scan_iters(config)
            .unwrap()
            .map(|s| s.unwrap())
            .filter_map(|s| match s {
                ScanStep::Step(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn ab_loops() -> Vec<LoopSpec> {
        vec![
            LoopSpec::single("a", LoopSource::range(2)),
            LoopSpec::single("b", LoopSource::range(3)),
        ]
    }

    #[test]
    fn cartesian_coverage_in_lexicographic_order() {
        let got = steps(ScanConfig {
            loops: ab_loops(),
            ..Default::default()
        });

        let expect = [
            (0, 0),
            (0, 1),
            (0, 2),
            (1, 0),
            (1, 1),
            (1, 2),
        ];
        assert_eq!(got.len(), expect.len());
        for (n, (step, (a, b))) in got.iter().zip(expect).enumerate() {
            assert_eq!(step.iteration, n);
            assert_eq!(step.kwds["a"], Value::Int(a));
            assert_eq!(step.kwds["b"], Value::Int(b));
            assert_eq!(step.pos, vec![a as usize, b as usize]);
            assert_eq!(step.index, vec![a as usize, b as usize]);
        }
        assert_eq!(got[0].unchanged, 0);
        assert_eq!(got[1].unchanged, 1);
        assert_eq!(got[3].unchanged, 0);
    }

    #[test]
    fn filter_suppresses_but_still_advances_pos() {
        let got = steps(ScanConfig {
            loops: ab_loops(),
            filter: Some(Arc::new(|kw: &Kwds| {
                kw["a"].as_i64().unwrap() < kw["b"].as_i64().unwrap()
            })),
            ..Default::default()
        });

        let pos: Vec<_> = got.iter().map(|s| s.pos.clone()).collect();
        assert_eq!(pos, vec![vec![0, 1], vec![0, 2], vec![1, 2]]);
        // index counts the yielded sequence, not the unfiltered one
        let index: Vec<_> = got.iter().map(|s| s.index.clone()).collect();
        assert_eq!(index, vec![vec![0, 0], vec![0, 1], vec![1, 0]]);
        let iters: Vec<_> = got.iter().map(|s| s.iteration).collect();
        assert_eq!(iters, vec![0, 1, 2]);
    }

    #[test]
    fn derived_variables_follow_dependencies() {
        // a in [1,2,3]; b = a * [0,1,2]; x = a + 0.5; y = x + a + b
        let loops = vec![
            LoopSpec::single("a", LoopSource::values([1i64, 2, 3])),
            LoopSpec::single(
                "b",
                LoopSource::Expr(Expr::symbol("a") * Expr::constant(vec![0i64, 1, 2])),
            ),
        ];
        let mut functions = BTreeMap::new();
        functions.insert("x".to_string(), FunctionDef::Expr(Expr::symbol("a") + 0.5));
        functions.insert(
            "y".to_string(),
            FunctionDef::Expr(Expr::symbol("x") + Expr::symbol("a") + Expr::symbol("b")),
        );

        let got = steps(ScanConfig {
            loops,
            functions,
            ..Default::default()
        });
        assert_eq!(got.len(), 9);

        // spot-check the a == 2 block
        let block: Vec<_> = got
            .iter()
            .filter(|s| s.kwds["a"] == Value::Int(2))
            .collect();
        assert_eq!(block.len(), 3);
        for (j, step) in block.iter().enumerate() {
            assert_eq!(step.kwds["b"].as_f64().unwrap(), 2.0 * j as f64);
            assert_eq!(step.kwds["x"], Value::Float(2.5));
            assert_eq!(
                step.kwds["y"].as_f64().unwrap(),
                2.5 + 2.0 + 2.0 * j as f64
            );
        }
    }

    #[test]
    fn parallel_tuple_ends_on_shortest() {
        let loops = vec![LoopSpec::zip([
            (vec!["a".to_string()], LoopSource::values([1i64, 2, 3])),
            (vec!["b".to_string()], LoopSource::values([10i64, 20])),
        ])];
        let got = steps(ScanConfig {
            loops,
            ..Default::default()
        });
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].kwds["a"], Value::Int(2));
        assert_eq!(got[1].kwds["b"], Value::Int(20));
    }

    #[test]
    fn generator_loops_see_outer_bindings() {
        let loops = vec![
            LoopSpec::single("a", LoopSource::values([1i64, 2])),
            LoopSpec::single(
                "g",
                LoopSource::generator(["a"], |kw: &Kwds| {
                    let a = kw["a"].as_i64().unwrap();
                    Ok(Box::new((0..2).map(move |i| Value::Int(a * 10 + i))))
                }),
            ),
        ];
        let got = steps(ScanConfig {
            loops,
            ..Default::default()
        });
        let g: Vec<_> = got.iter().map(|s| s.kwds["g"].clone()).collect();
        assert_eq!(
            g,
            vec![
                Value::Int(10),
                Value::Int(11),
                Value::Int(20),
                Value::Int(21)
            ]
        );
    }

    #[test]
    fn tuple_key_unpacks_pairs() {
        let loops = vec![LoopSpec::zip([(
            vec!["u".to_string(), "v".to_string()],
            LoopSource::generator([], |_| {
                Ok(Box::new((0..2i64).map(|i| {
                    Value::Array(data_types::ArrayValue::vector(vec![
                        Value::Int(i * 100),
                        Value::Int(-i * 200),
                    ]))
                })))
            }),
        )])];
        let got = steps(ScanConfig {
            loops,
            ..Default::default()
        });
        assert_eq!(got[1].kwds["u"], Value::Int(100));
        assert_eq!(got[1].kwds["v"], Value::Int(-200));
    }

    #[test]
    fn wrong_arity_is_a_clear_error() {
        let loops = vec![LoopSpec::zip([(
            vec!["u".to_string(), "v".to_string()],
            LoopSource::values([1i64, 2]),
        )])];
        let mut it = scan_iters(ScanConfig {
            loops,
            ..Default::default()
        })
        .unwrap();
        assert_matches!(it.next(), Some(Err(Error::KeyArity { keys, .. })) => {
            assert_eq!(keys, vec!["u".to_string(), "v".to_string()]);
        });
        assert!(it.next().is_none());
    }

    #[test]
    fn level_markers_wrap_every_iteration_body() {
        let loops = vec![
            LoopSpec::single("a", LoopSource::range(2)),
            LoopSpec::single("b", LoopSource::range(2)),
        ];
        let got: Vec<ScanStep> = scan_iters(ScanConfig {
            loops,
            level_marker: true,
            ..Default::default()
        })
        .unwrap()
        .map(|s| s.unwrap())
        .collect();

        let tags: Vec<String> = got
            .iter()
            .map(|s| match s {
                ScanStep::Begin(i) => format!("B{}", i.level),
                ScanStep::End(i) => format!("E{}", i.level),
                ScanStep::Step(_) => "S".to_string(),
            })
            .collect();
        assert_eq!(
            tags.join(" "),
            "B0 B1 S E1 B1 S E1 E0 B0 B1 S E1 B1 S E1 E0"
        );

        // markers carry the iteration number of the last real step
        let last = got
            .iter()
            .rev()
            .find_map(|s| match s {
                ScanStep::End(i) => Some(i.iteration),
                _ => None,
            })
            .unwrap();
        assert_eq!(last, 3);
    }

    #[test]
    fn constants_and_prescan_functions_are_bound_everywhere() {
        let mut constants = Kwds::new();
        constants.insert("c".to_string(), Value::Int(7));
        let mut functions = BTreeMap::new();
        functions.insert("pre".to_string(), FunctionDef::Expr(Expr::symbol("c") * 2));

        let got = steps(ScanConfig {
            loops: vec![LoopSpec::single("a", LoopSource::range(2))],
            functions,
            constants,
            ..Default::default()
        });
        for s in &got {
            assert_eq!(s.kwds["c"], Value::Int(7));
            assert_eq!(s.kwds["pre"], Value::Int(14));
        }
        assert_eq!(got[0].vars, vec![vec!["a".to_string()]]);
    }

    /// Remembers the best (lowest) observed value, suggests it back.
    struct BestSeen {
        asked: usize,
        best: Option<(Vec<Value>, f64)>,
        start: f64,
        log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    impl Optimizer for BestSeen {
        fn ask(&mut self) -> Vec<Value> {
            self.log.lock().push("ask");
            self.asked += 1;
            match &self.best {
                Some((x, _)) => x.clone(),
                None => vec![Value::Float(self.start)],
            }
        }

        fn tell(&mut self, suggested: Vec<Value>, value: Value) {
            self.log.lock().push("tell");
            let v = value.as_f64().unwrap();
            if self.best.as_ref().map_or(true, |(_, b)| v < *b) {
                self.best = Some((suggested, v));
            }
        }

        fn get_result(&self) -> OptimizeResult {
            OptimizeResult {
                x: self
                    .best
                    .as_ref()
                    .map(|(x, _)| x.clone())
                    .unwrap_or_else(|| vec![Value::Float(self.start)]),
                fun: self.best.as_ref().map(|(_, v)| Value::Float(*v)),
            }
        }
    }

    #[test]
    fn optimizer_loop_asks_tells_and_substitutes_result() {
        const N: usize = 5;
        let log = Arc::new(parking_lot::Mutex::new(vec![]));
        let log2 = Arc::clone(&log);
        let cfg = OptimizerConfig::with_factory(
            vec![Dimension::new("x", 0.0, 1.0)],
            N,
            true,
            Arc::new(move |_dims| {
                Box::new(BestSeen {
                    asked: 0,
                    best: None,
                    start: 0.9,
                    log: Arc::clone(&log2),
                })
            }),
        );
        let loops = vec![LoopSpec::single("x", LoopSource::Optimizer(cfg))];

        let mut it = scan_iters(ScanConfig {
            loops,
            ..Default::default()
        })
        .unwrap();

        let mut seen = vec![];
        let mut n = 0usize;
        while let Some(step) = it.next() {
            let step = step.unwrap();
            if let ScanStep::Step(s) = step {
                n += 1;
                let x = s.kwds["x"].as_f64().unwrap();
                seen.push(x);
                // objective: distance from 0.2; suggest a better point
                // than the optimizer's own on the first few iterations
                let probe = x / 2.0;
                s.feedback_with(
                    &["x"],
                    vec![Value::Float(probe)],
                    Value::Float((probe - 0.2).abs()),
                );
            }
        }
        assert_eq!(n, N);
        // the last step used get_result().x = best suggested coordinate
        let best = seen[seen.len() - 1];
        assert!((best - 0.2).abs() < 0.15, "final x = {best}");

        // every step preceded by one ask (except the final get_result) and
        // followed by its tell before the next ask
        let log = log.lock();
        let asks = log.iter().filter(|s| **s == "ask").count();
        let tells = log.iter().filter(|s| **s == "tell").count();
        assert_eq!(asks, N - 1);
        assert_eq!(tells, N);
        assert_eq!(log[0], "ask");
        assert_eq!(log[1], "tell");
    }

    #[test]
    fn generator_failure_aborts_the_scan() {
        let loops = vec![LoopSpec::single(
            "g",
            LoopSource::generator([], |_| Err("instrument offline".into())),
        )];
        let mut it = scan_iters(ScanConfig {
            loops,
            ..Default::default()
        })
        .unwrap();
        assert_matches!(it.next(), Some(Err(Error::Generator { .. })));
        assert!(it.next().is_none());
    }

    #[test]
    fn pool_evaluates_group_members_to_concrete_values() {
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        );
        let mut functions = BTreeMap::new();
        functions.insert("u".to_string(), FunctionDef::Expr(Expr::symbol("a") * 2));
        functions.insert("v".to_string(), FunctionDef::Expr(Expr::symbol("a") + 1));

        let got = steps(ScanConfig {
            loops: vec![LoopSpec::single("a", LoopSource::range(3))],
            functions,
            pool: Some(pool),
            ..Default::default()
        });
        for s in &got {
            let a = s.kwds["a"].as_i64().unwrap();
            assert_eq!(s.kwds["u"], Value::Int(a * 2));
            assert_eq!(s.kwds["v"], Value::Int(a + 1));
        }
    }

    #[test]
    fn empty_loop_map_yields_nothing() {
        let mut it = scan_iters(ScanConfig::default()).unwrap();
        assert!(it.next().is_none());
    }
}
