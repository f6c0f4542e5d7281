mod common;

use std::collections::HashMap;

use common::{graph, stage};
use proptest::prelude::*;
use texture_forge::{
    StageId,
    evaluation::{MAX_INPUTS, order},
};

#[derive(Debug, Clone)]
enum Op {
    Add,
    Delete(usize),
    Connect { consumer: usize, slot: usize, producer: usize },
    Disconnect { consumer: usize, slot: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Add),
        1 => any::<usize>().prop_map(Op::Delete),
        4 => (any::<usize>(), 0..MAX_INPUTS, any::<usize>())
            .prop_map(|(consumer, slot, producer)| Op::Connect { consumer, slot, producer }),
        1 => (any::<usize>(), 0..MAX_INPUTS)
            .prop_map(|(consumer, slot)| Op::Disconnect { consumer, slot }),
    ]
}

/// Reference model: positions plus per-stage input slots.
#[derive(Default)]
struct Model {
    positions: Vec<StageId>,
    inputs: HashMap<StageId, [Option<StageId>; MAX_INPUTS]>,
}

impl Model {
    fn producers(&self, id: StageId) -> Vec<StageId> {
        self.inputs
            .get(&id)
            .map(|slots| slots.iter().flatten().copied().collect())
            .unwrap_or_default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn positional_view_matches_model(ops in prop::collection::vec(op(), 1..40)) {
        let mut g = graph();
        let mut model = Model::default();

        for op in ops {
            let len = model.positions.len();
            match op {
                Op::Add => {
                    let id = stage(&mut g, "Blur");
                    model.positions.push(id);
                    model.inputs.insert(id, [None; MAX_INPUTS]);
                }
                Op::Delete(i) if len > 0 => {
                    let id = model.positions.remove(i % len);
                    model.inputs.remove(&id);
                    for slots in model.inputs.values_mut() {
                        for slot in slots.iter_mut() {
                            if *slot == Some(id) {
                                *slot = None;
                            }
                        }
                    }
                    g.del_evaluation_target(id).unwrap();
                }
                Op::Connect { consumer, slot, producer } if len > 0 => {
                    let c = model.positions[consumer % len];
                    let p = model.positions[producer % len];
                    let cycle = order::would_create_cycle(c, p, |k| model.producers(k));
                    let result = g.add_evaluation_input(c, slot, p);
                    prop_assert_eq!(result.is_err(), cycle);
                    if !cycle {
                        model.inputs.get_mut(&c).unwrap()[slot] = Some(p);
                    }
                }
                Op::Disconnect { consumer, slot } if len > 0 => {
                    let c = model.positions[consumer % len];
                    g.del_evaluation_input(c, slot).unwrap();
                    model.inputs.get_mut(&c).unwrap()[slot] = None;
                }
                _ => {}
            }

            prop_assert_eq!(g.len(), model.positions.len());
            for (i, id) in model.positions.iter().enumerate() {
                prop_assert_eq!(g.stage_at(i), Some(*id));
                prop_assert_eq!(g.index_of(*id), Some(i));
                let expected = model.inputs[id].map(|slot| {
                    slot.and_then(|p| model.positions.iter().position(|q| *q == p))
                });
                prop_assert_eq!(g.input_indices(*id).unwrap(), expected);
            }
            prop_assert!(g.order_is_topological());
            let mut order = g.evaluation_order_indices();
            order.sort_unstable();
            prop_assert_eq!(order, (0..model.positions.len()).collect::<Vec<_>>());
        }
    }
}
