//! Rewrites a draft graph into the executable graph the host schedules.
//!
//! Compilation walks the draft once, in declaration order, and produces
//! exactly one [`ActualNode`] per [`DraftNode`]: same topology, same
//! parallelism and chaining, but the executable is the user stage behind
//! an [`OperatorWrapper`] and every edge type is lifted to the envelope.
//! Regular inputs must already be translated when their consumer is
//! reached; only declared feedback edges may point forward, and those are
//! bound once the loop-closing node exists.
//!
//! Translation is a pure function of the draft node and its resolved
//! upstreams: compiling the same draft twice yields structurally
//! equivalent graphs.

use std::sync::Arc;

use crate::dataflow::Chaining;
use crate::dataflow::DraftGraph;
use crate::dataflow::DraftNode;
use crate::dataflow::InputShape;
use crate::dataflow::NodeId;
use crate::errors::CompileError;
use crate::record::Envelope;
use crate::state::KeySelector;
use crate::state::StateBytes;
use crate::state::StateKey;
use crate::state::StepId;
use crate::typeinfo::EnvelopeTypeInfo;
use crate::wrapper::OperatorWrapper;
use crate::wrapper::WrapperConfig;

/// Builds one runnable instance of a translated node, optionally from a
/// prior snapshot. The host calls this once per parallel subtask.
pub type WrapperBuilder<T> =
    Arc<dyn Fn(Option<StateBytes>) -> OperatorWrapper<T> + Send + Sync>;

/// Key selector over envelopes, derived from a draft node's payload
/// selector.
///
/// `None` for epoch markers: they carry no key and the host routes them
/// to every partition of the consumer.
pub type EnvelopeKeySelector<T> = Arc<dyn Fn(&Envelope<T>) -> Option<StateKey> + Send + Sync>;

/// One input channel of a translated node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ActualInput {
    pub upstream: NodeId,
    pub channel: usize,
    /// Routed through the side-input cache before reaching the stage.
    pub broadcast: bool,
    /// Bound through a declared loop-closing edge.
    pub feedback: bool,
}

/// The translated, executable counterpart of one draft node.
///
/// Immutable once built, apart from nothing: the compiler fills in every
/// field and the host only reads them.
pub struct ActualNode<T> {
    pub id: NodeId,
    pub name: StepId,
    pub inputs: Vec<ActualInput>,
    pub executable: WrapperBuilder<T>,
    /// The draft node's output descriptor, lifted over the envelope.
    pub output_type: EnvelopeTypeInfo<T>,
    /// Derived selector partitioning by the unwrapped payload, never the
    /// round.
    pub key_selector: Option<EnvelopeKeySelector<T>>,
    pub parallelism: usize,
    pub chaining: Chaining,
}

/// The compiled graph, ready for the host's graph-execution layer.
pub struct ActualGraph<T> {
    nodes: Vec<ActualNode<T>>,
}

impl<T> ActualGraph<T> {
    pub fn nodes(&self) -> &[ActualNode<T>] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&ActualNode<T>> {
        self.nodes.get(id.0)
    }
}

// `ActualNode` holds boxed executables/selectors that are not `Debug`, so
// the graph cannot derive it; the tests need `ActualGraph: Debug` only so
// `Result::unwrap_err` can render the unexpected-`Ok` case. Summarize the
// translated nodes by their id and name, mirroring the manual `Debug`
// impls used elsewhere in the crate for closure-bearing types.
impl<T> std::fmt::Debug for ActualGraph<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.debug_struct("ActualGraph")
            .field(
                "nodes",
                &self
                    .nodes
                    .iter()
                    .map(|node| (node.id, &node.name))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Lift a payload key selector over envelopes.
///
/// Records key by their payload; epochs have no key.
pub fn wrap_key_selector<T: 'static>(selector: KeySelector<T>) -> EnvelopeKeySelector<T> {
    Arc::new(move |envelope| match envelope {
        Envelope::Record { payload, .. } => Some(selector(payload)),
        Envelope::Epoch { .. } => None,
    })
}

/// Compile a whole draft graph.
///
/// Fails fast on the first malformed declaration; nothing is ever
/// half-compiled into the host.
pub fn compile<T: 'static>(draft: &DraftGraph<T>) -> Result<ActualGraph<T>, CompileError> {
    let mut nodes = Vec::with_capacity(draft.nodes().len());
    for (index, node) in draft.nodes().iter().enumerate() {
        nodes.push(translate(draft, NodeId(index), node)?);
    }

    // Every declared feedback edge must have been consumed by its
    // target's shape, and both endpoints must exist by now.
    for edge in draft.feedback() {
        let matched = nodes
            .get(edge.target.0)
            .map(|target: &ActualNode<T>| {
                target.inputs.iter().any(|input| {
                    input.channel == edge.channel
                        && input.upstream == edge.source
                        && input.feedback
                })
            })
            .unwrap_or(false);
        if !matched || edge.source.0 >= nodes.len() {
            return Err(CompileError::DanglingFeedback {
                source: edge.source,
                target: edge.target,
                channel: edge.channel,
            });
        }
    }

    tracing::info!(nodes = nodes.len(), "compiled draft graph");
    Ok(ActualGraph { nodes })
}

/// Translate one draft node, given that all nodes before `id` are
/// already translated.
fn translate<T: 'static>(
    draft: &DraftGraph<T>,
    id: NodeId,
    node: &DraftNode<T>,
) -> Result<ActualNode<T>, CompileError> {
    let span = tracing::debug_span!("translate", node = node.name.0.clone());
    let _guard = span.enter();

    // Dispatch over the closed shape set. Every arm resolves its
    // upstream references; the per-shape difference is only which
    // channels exist and which one the cache guards.
    let inputs = match node.shape {
        InputShape::Source => Vec::new(),
        InputShape::OneInput(upstream) => {
            vec![resolve(draft, id, upstream, 0, false)?]
        }
        InputShape::TwoInput(first, second) => vec![
            resolve(draft, id, first, 0, false)?,
            resolve(draft, id, second, 1, false)?,
        ],
        InputShape::BroadcastPair { regular, broadcast } => vec![
            resolve(draft, id, regular, 0, false)?,
            resolve(draft, id, broadcast, 1, true)?,
        ],
    };

    let config = WrapperConfig {
        step_id: node.name.clone(),
        num_inputs: node.shape.arity(),
        broadcast_channel: node.shape.broadcast_channel(),
    };
    let logic = node.logic.clone();
    let key_selector = node.key_selector.clone();
    let executable: WrapperBuilder<T> = Arc::new(move |resume_snapshot| {
        OperatorWrapper::build(
            config.clone(),
            key_selector.clone(),
            &logic,
            resume_snapshot,
        )
    });

    Ok(ActualNode {
        id,
        name: node.name.clone(),
        inputs,
        executable,
        output_type: EnvelopeTypeInfo::new(node.output_type.clone()),
        key_selector: node.key_selector.clone().map(wrap_key_selector),
        parallelism: node.parallelism,
        chaining: node.chaining,
    })
}

/// Resolve one upstream reference of `node` into an input binding.
fn resolve<T>(
    draft: &DraftGraph<T>,
    node: NodeId,
    upstream: NodeId,
    channel: usize,
    broadcast: bool,
) -> Result<ActualInput, CompileError> {
    if upstream.0 >= draft.nodes().len() {
        return Err(CompileError::UnknownNode { node, upstream });
    }

    let feedback = draft
        .feedback()
        .iter()
        .any(|edge| edge.target == node && edge.channel == channel && edge.source == upstream);
    if !feedback && upstream.0 >= node.0 {
        // A forward reference is only legal through a declared feedback
        // edge.
        return Err(CompileError::UntranslatedUpstream { node, upstream });
    }

    Ok(ActualInput {
        upstream,
        channel,
        broadcast,
        feedback,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::BoxError;
    use crate::record::Round;
    use crate::stage::LogicBuilder;
    use crate::stage::StageLogic;
    use crate::state::Route;
    use crate::typeinfo::SerdeTypeInfo;
    use crate::typeinfo::TypeDescriptor;

    struct Increment;

    impl StageLogic<i64> for Increment {
        fn process(&mut self, _channel: usize, payload: i64) -> Result<Vec<i64>, BoxError> {
            Ok(vec![payload + 1])
        }

        fn snapshot(&self) -> StateBytes {
            StateBytes::ser(&())
        }
    }

    fn increment_builder() -> LogicBuilder<i64> {
        Arc::new(|_resume| Box::new(Increment))
    }

    fn i64_type() -> Arc<dyn TypeDescriptor<i64>> {
        Arc::new(SerdeTypeInfo::<i64>::new())
    }

    fn parity_selector() -> KeySelector<i64> {
        Arc::new(|payload| {
            StateKey::Hash(if payload % 2 == 0 { "even" } else { "odd" }.to_owned())
        })
    }

    /// source -> keyed increment, plus a loop closed by feedback from a
    /// tail node back into the body.
    fn looped_draft() -> DraftGraph<i64> {
        let mut draft = DraftGraph::new();
        let source = draft.add_node(DraftNode::new(
            "feed",
            InputShape::Source,
            increment_builder(),
            i64_type(),
        ));
        let body = draft.add_node(
            DraftNode::new(
                "body",
                InputShape::TwoInput(source, NodeId(2)),
                increment_builder(),
                i64_type(),
            )
            .with_key_selector(parity_selector())
            .with_parallelism(4)
            .with_chaining(Chaining::Never),
        );
        let tail = draft.add_node(DraftNode::new(
            "tail",
            InputShape::OneInput(body),
            increment_builder(),
            i64_type(),
        ));
        draft.add_feedback(tail, body, 1);
        draft
    }

    #[test]
    fn compiles_loops_through_declared_feedback() {
        let graph = compile(&looped_draft()).unwrap();

        let body = graph.node(NodeId(1)).unwrap();
        assert_eq!(
            body.inputs,
            vec![
                ActualInput {
                    upstream: NodeId(0),
                    channel: 0,
                    broadcast: false,
                    feedback: false,
                },
                ActualInput {
                    upstream: NodeId(2),
                    channel: 1,
                    broadcast: false,
                    feedback: true,
                },
            ],
        );
        // Non-semantic properties copy verbatim.
        assert_eq!(body.name, StepId::from("body"));
        assert_eq!(body.parallelism, 4);
        assert_eq!(body.chaining, Chaining::Never);
    }

    #[test]
    fn undeclared_forward_reference_is_fatal() {
        let mut draft = DraftGraph::new();
        draft.add_node(DraftNode::new(
            "early",
            InputShape::OneInput(NodeId(1)),
            increment_builder(),
            i64_type(),
        ));
        draft.add_node(DraftNode::new(
            "late",
            InputShape::Source,
            increment_builder(),
            i64_type(),
        ));

        let found = compile(&draft).unwrap_err();
        let expected = CompileError::UntranslatedUpstream {
            node: NodeId(0),
            upstream: NodeId(1),
        };
        assert_eq!(found, expected);
    }

    #[test]
    fn unknown_upstream_is_fatal() {
        let mut draft = DraftGraph::new();
        draft.add_node(DraftNode::new(
            "orphan",
            InputShape::OneInput(NodeId(7)),
            increment_builder(),
            i64_type(),
        ));

        let found = compile(&draft).unwrap_err();
        let expected = CompileError::UnknownNode {
            node: NodeId(0),
            upstream: NodeId(7),
        };
        assert_eq!(found, expected);
    }

    #[test]
    fn feedback_must_match_the_targets_inputs() {
        let mut draft = DraftGraph::new();
        let source = draft.add_node(DraftNode::new(
            "feed",
            InputShape::Source,
            increment_builder(),
            i64_type(),
        ));
        let body = draft.add_node(DraftNode::new(
            "body",
            InputShape::OneInput(source),
            increment_builder(),
            i64_type(),
        ));
        // The body never declared a channel 1.
        draft.add_feedback(source, body, 1);

        let found = compile(&draft).unwrap_err();
        let expected = CompileError::DanglingFeedback {
            source: NodeId(0),
            target: NodeId(1),
            channel: 1,
        };
        assert_eq!(found, expected);
    }

    #[test]
    fn translation_is_idempotent() {
        let draft = looped_draft();
        let first = compile(&draft).unwrap();
        let second = compile(&draft).unwrap();

        for (a, b) in first.nodes().iter().zip(second.nodes()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.inputs, b.inputs);
            assert_eq!(a.parallelism, b.parallelism);
            assert_eq!(a.chaining, b.chaining);
            assert_eq!(a.output_type, b.output_type);
        }

        // The wrapped executables behave identically too.
        let drive = |node: &ActualNode<i64>| {
            let mut wrapper = (node.executable)(None);
            let mut out = Vec::new();
            out.extend(wrapper.on_envelope(0, Envelope::initial(10)).unwrap());
            out.extend(
                wrapper
                    .on_envelope(0, Envelope::Epoch { round: Round(0) })
                    .unwrap(),
            );
            out
        };
        let found = drive(&second.nodes()[2]);
        let expected = drive(&first.nodes()[2]);
        assert_eq!(found, expected);
    }

    #[test]
    fn derived_keys_ignore_the_round() {
        let graph = compile(&looped_draft()).unwrap();
        let body = graph.node(NodeId(1)).unwrap();
        let selector = body.key_selector.as_ref().unwrap();

        let early = Envelope::Record {
            payload: 12,
            round: Round(0),
        };
        let late = Envelope::Record {
            payload: 12,
            round: Round(9),
        };

        let found = selector(&early).unwrap();
        let expected = selector(&late).unwrap();
        assert_eq!(found, expected);
        // Same key, same partition, regardless of round.
        assert_eq!(
            found.route() % body.parallelism as u64,
            expected.route() % body.parallelism as u64,
        );

        // Epochs carry no key; the host fans them out to every partition.
        assert_eq!(selector(&Envelope::Epoch { round: Round(1) }), None);
    }

    #[test]
    fn output_descriptor_is_the_envelope_lift_of_the_drafts() {
        let graph = compile(&looped_draft()).unwrap();

        let found = &graph.node(NodeId(0)).unwrap().output_type;
        let expected = EnvelopeTypeInfo::new(i64_type());
        assert_eq!(*found, expected);
    }

    #[test]
    fn broadcast_inputs_are_cache_guarded() {
        let mut draft = DraftGraph::new();
        let data = draft.add_node(DraftNode::new(
            "data",
            InputShape::Source,
            increment_builder(),
            i64_type(),
        ));
        let model = draft.add_node(DraftNode::new(
            "model",
            InputShape::Source,
            increment_builder(),
            i64_type(),
        ));
        let apply = draft.add_node(DraftNode::new(
            "apply",
            InputShape::BroadcastPair {
                regular: data,
                broadcast: model,
            },
            increment_builder(),
            i64_type(),
        ));
        let graph = compile(&draft).unwrap();

        let apply = graph.node(apply).unwrap();
        assert!(apply.inputs[1].broadcast);
        assert!(!apply.inputs[0].broadcast);

        // The built executable holds broadcast traffic until readiness.
        let mut wrapper = (apply.executable)(None);
        assert_eq!(
            wrapper.on_envelope(1, Envelope::initial(5)).unwrap(),
            Vec::new(),
        );
        let found = wrapper.on_broadcast_ready().unwrap();
        let expected = vec![Envelope::Record {
            payload: 6,
            round: Round(0),
        }];
        assert_eq!(found, expected);
    }
}
