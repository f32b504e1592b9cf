use std::sync::mpsc;
use std::thread;

use float_cmp::assert_approx_eq;
use num_complex::Complex64;
use tne::engine::{Engine, EngineConfig};
use tne::error::TneError;
use tne::reconstructor::Reconstructor;
use tne::runtime::process_group::{LoopbackComm, WORLD_GROUP};
use tne::tensornetwork::composite::SplitDirective;
use tne::tensornetwork::expansion::TensorExpansion;
use tne::tensornetwork::network::TensorNetwork;
use tne::tensornetwork::tensor::Tensor;
use tne::types::{ElementType, ScalarValue};

fn engine() -> Engine {
    Engine::new(EngineConfig::default()).unwrap()
}

#[test]
fn test_scalar_dot_product() {
    let engine = engine();
    engine
        .create_tensor_sync("u", vec![4], ElementType::Complex64)
        .unwrap();
    engine
        .create_tensor_sync("v", vec![4], ElementType::Complex64)
        .unwrap();
    engine
        .init_tensor_data(
            "u",
            (1..=4).map(|v| Complex64::new(f64::from(v), 0.0)).collect(),
        )
        .unwrap();
    engine
        .init_tensor_data(
            "v",
            (1..=4)
                .rev()
                .map(|v| Complex64::new(f64::from(v), 0.0))
                .collect(),
        )
        .unwrap();
    let network = TensorNetwork::from_symbolic("s()=u(i)*v(i)", |name| {
        engine.tensor(name).ok()
    })
    .unwrap();
    engine.evaluate_network_sync(&network).unwrap();
    // 1*4 + 2*3 + 3*2 + 4*1 = 20.
    assert_eq!(engine.scalar_value("s").unwrap(), Complex64::new(20.0, 0.0));
}

/// The 3-site MPS closure: the scalar value must not depend on the chosen
/// planner algorithm.
#[test]
fn test_mps_closure_planner_independent() {
    let engine = engine();
    engine.set_plan_caching(false);
    let shapes: [(&str, Vec<u64>); 7] = [
        ("T0", vec![2, 2]),
        ("T1", vec![2, 2, 2]),
        ("T2", vec![2, 2]),
        ("H0", vec![2, 2, 2, 2]),
        ("S0", vec![2, 2]),
        ("S1", vec![2, 2, 2]),
        ("S2", vec![2, 2]),
    ];
    for (index, (name, shape)) in shapes.into_iter().enumerate() {
        engine
            .create_tensor_sync(name, shape, ElementType::Complex64)
            .unwrap();
        engine.init_tensor_rnd(name, index as u64 + 1).unwrap();
    }
    engine.sync_all(false).unwrap();

    let mut values = Vec::new();
    for planner in ["dummy", "heuro", "greed", "metis"] {
        engine.select_planner(planner).unwrap();
        let text = format!(
            "Z_{planner}()=T0(a,b)*T1(b,c,d)*T2(d,e)*H0(a,c,f,g)*S0(f,h)*S1(h,g,i)*S2(i,e)"
        );
        let network =
            TensorNetwork::from_symbolic(&text, |name| engine.tensor(name).ok()).unwrap();
        engine.evaluate_network_sync(&network).unwrap();
        values.push(engine.scalar_value(&format!("Z_{planner}")).unwrap());
    }
    for value in &values[1..] {
        assert_approx_eq!(f64, value.re, values[0].re, epsilon = 1e-12);
        assert_approx_eq!(f64, value.im, values[0].im, epsilon = 1e-12);
    }
}

#[test]
fn test_composite_split_tiles_parent() {
    let engine = engine();
    let blocks = engine
        .create_composite_tensor(
            "C",
            vec![2, 2, 4, 8],
            ElementType::Complex64,
            vec![
                SplitDirective { dim: 2, depth: 1 },
                SplitDirective { dim: 3, depth: 2 },
            ],
            None,
            WORLD_GROUP,
        )
        .unwrap();
    assert_eq!(blocks, 8);
    let composite = engine.composite("C").unwrap();
    assert_eq!(composite.total_elements(), 2 * 2 * 4 * 8);
    // Offsets tile the split dimensions without overlap.
    let mut covered = vec![vec![false; 4], vec![false; 8]];
    for block in composite.blocks() {
        engine.sync_tensor(block.tensor.name()).unwrap();
        for (split_pos, dim) in [(0usize, 2usize), (1, 3)] {
            let offset = block.offsets[dim] as usize;
            let extent = block.tensor.shape()[dim] as usize;
            for slot in offset..offset + extent {
                covered[split_pos][slot] = true;
            }
        }
    }
    assert!(covered.iter().all(|dim| dim.iter().all(|&c| c)));
    engine.destroy_tensor("C").unwrap();
    engine.sync_all(true).unwrap();
}

/// Builds the symbolic text of an 8-site MPS with open physical legs
/// `p0..p7` and internal bonds named after `site_prefix`.
fn mps_text(output: &str, site_prefix: &str) -> String {
    let mut text = format!(
        "{output}(p0,p1,p2,p3,p4,p5,p6,p7)={site_prefix}0(p0,{site_prefix}b0)"
    );
    for site in 1..7 {
        text += &format!(
            "*{site_prefix}{site}({site_prefix}b{},p{site},{site_prefix}b{site})",
            site - 1
        );
    }
    text += &format!("*{site_prefix}7({site_prefix}b6,p7)");
    text
}

/// Reconstruction of a random rank-8 MPS of bond dimension 6 by a bond-4
/// approximant. The lower bond cannot represent the target exactly, so the
/// fidelity `|<Y|X>|^2` stays strictly below one.
#[test]
fn test_reconstructor_mps_bond_truncation() {
    let engine = engine();
    for (prefix, bond, seed_base) in [("M", 6u64, 10u64), ("W", 4u64, 20u64)] {
        for site in 0..8u64 {
            let shape = match site {
                0 => vec![2, bond],
                7 => vec![bond, 2],
                _ => vec![bond, 2, bond],
            };
            let name = format!("{prefix}{site}");
            engine
                .create_tensor_sync(&name, shape, ElementType::Complex64)
                .unwrap();
            engine.init_tensor_rnd(&name, seed_base + site).unwrap();
            if prefix == "W" {
                // Near-canonical start keeps <Y|Y> and the gradients tame.
                engine.orthogonalize_mgs(&name).unwrap();
            }
        }
    }
    engine.sync_all(false).unwrap();

    let resolver = |name: &str| engine.tensor(name).ok();
    let target = TensorNetwork::from_symbolic(&mps_text("X", "M"), resolver).unwrap();

    // Normalize the target so the reported fidelity lands in [0, 1].
    let mut unit = TensorExpansion::new_ket("Xraw");
    unit.append_network(target.clone(), Complex64::new(1.0, 0.0))
        .unwrap();
    let mut unit_bra = unit.clone();
    unit_bra.conjugate();
    let target_norm2 = TensorExpansion::inner_product(&unit_bra, &unit).unwrap();
    engine
        .create_tensor_sync("_nrm", vec![], ElementType::Complex64)
        .unwrap();
    engine
        .evaluate_expansion_sync(&target_norm2, "_nrm", 1)
        .unwrap();
    let norm2 = engine.scalar_value("_nrm").unwrap().re;
    assert!(norm2 > 0.0);
    engine.destroy_tensor_sync("_nrm").unwrap();
    let mut expansion = TensorExpansion::new_ket("Xexp");
    expansion
        .append_network(target, Complex64::new(1.0 / norm2.sqrt(), 0.0))
        .unwrap();

    let approx =
        TensorNetwork::from_symbolic(&mps_text("Y", "W"), resolver).unwrap();
    let mut approximant = TensorExpansion::new_ket("Yexp");
    approximant
        .append_network(approx, Complex64::new(1.0, 0.0))
        .unwrap();
    for site in 0..8 {
        approximant.reset_optimizability(&format!("W{site}"), true);
    }
    approximant.conjugate();

    let mut reconstructor =
        Reconstructor::new(&engine, expansion, approximant, 5e-3).unwrap();
    reconstructor.reset_learn_rate(0.05);
    reconstructor.reset_max_iterations(400);
    let outcome = reconstructor.reconstruct().unwrap();

    assert!(outcome.iterations >= 1);
    assert!(outcome.residual_norm2.is_finite());
    assert!(outcome.residual_norm2 >= -1e-9);
    // Fidelity |<Y|X>|^2 of a normalized target lies in [0, 1]; the bond-4
    // ansatz cannot reach the bond-6 target exactly.
    assert!(outcome.fidelity > 0.0);
    assert!(outcome.fidelity <= 1.0 + 1e-9);
    assert!(outcome.fidelity < 1.0);
    if outcome.converged {
        // The residual <X|X> + <Y|Y> - <Y|X> - <X|Y> settles well below its
        // initial value of about 1 + <Y|Y>.
        assert!(outcome.residual_norm2 <= 1.0);
    }
}

/// Replication over a four-rank loopback world: all ranks end up with
/// byte-identical buffers.
#[test]
fn test_replicate_consistency_over_four_ranks() {
    let world = LoopbackComm::world(4);
    let (sender, receiver) = mpsc::channel();
    let mut handles = Vec::new();
    for (rank, comm) in world.into_iter().enumerate() {
        let sender = sender.clone();
        handles.push(thread::spawn(move || {
            let engine = Engine::with_comm(EngineConfig::default(), comm).unwrap();
            let tensor = Tensor::new("B", vec![2, 4]);
            if rank == 0 {
                engine
                    .create_tensor_in_group(tensor, ElementType::Complex64, WORLD_GROUP)
                    .unwrap();
                engine.sync_tensor("B").unwrap();
                engine
                    .init_tensor_data(
                        "B",
                        (0..8).map(|v| Complex64::new(f64::from(v), -1.0)).collect(),
                    )
                    .unwrap();
            } else {
                engine
                    .declare_tensor(tensor, ElementType::Complex64, WORLD_GROUP)
                    .unwrap();
            }
            engine.replicate_tensor_sync("B", 0).unwrap();
            let rendering = engine.print_tensor("B").unwrap();
            sender.send((rank, rendering)).unwrap();
            engine.shutdown();
        }));
    }
    drop(sender);
    let mut renderings: Vec<(usize, String)> = receiver.iter().collect();
    renderings.sort();
    assert_eq!(renderings.len(), 4);
    for (_, rendering) in &renderings[1..] {
        assert_eq!(rendering, &renderings[0].1);
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_plan_cache_hit_on_second_evaluation() {
    let engine = engine();
    engine.select_planner("heuro").unwrap();
    engine.set_plan_caching(true);
    for (name, shape) in [("P", vec![2, 3]), ("Q", vec![3, 4]), ("R", vec![4, 2])] {
        engine
            .create_tensor_sync(name, shape, ElementType::Complex64)
            .unwrap();
        engine.init_tensor(name, ScalarValue::R64(1.0)).unwrap();
    }
    let resolver = |name: &str| engine.tensor(name).ok();
    let first =
        TensorNetwork::from_symbolic("D1(a,b)=P(a,i)*Q(i,j)*R(j,b)", resolver).unwrap();
    engine.evaluate_network_sync(&first).unwrap();
    let stats = engine.plan_cache_stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 1);
    let second =
        TensorNetwork::from_symbolic("D2(a,b)=P(a,i)*Q(i,j)*R(j,b)", resolver).unwrap();
    engine.evaluate_network_sync(&second).unwrap();
    let stats = engine.plan_cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    // Both evaluations produce the same values.
    assert_approx_eq!(
        f64,
        engine.norm2("D1").unwrap(),
        engine.norm2("D2").unwrap(),
        epsilon = 1e-12
    );
}

#[test]
fn test_svd_through_the_engine() {
    let engine = engine();
    for (name, shape) in [
        ("D", vec![4, 4]),
        ("L", vec![4, 4]),
        ("S", vec![4, 4]),
        ("R", vec![4, 4]),
        ("D2", vec![4, 4]),
        ("LS", vec![4, 4]),
    ] {
        engine
            .create_tensor_sync(name, shape, ElementType::Complex64)
            .unwrap();
    }
    engine.init_tensor_rnd("D", 42).unwrap();
    engine.decompose_svd3("D(a,b)=L(a,k)*S(k,l)*R(l,b)").unwrap();
    engine
        .contract_tensors("LS(a,l)+=L(a,k)*S(k,l)", ScalarValue::R64(1.0))
        .unwrap();
    engine
        .contract_tensors_sync("D2(a,b)+=LS(a,l)*R(l,b)", ScalarValue::R64(1.0))
        .unwrap();
    // L * S * R reproduces D.
    engine
        .add_tensors_sync("D2(a,b)+=D(a,b)", ScalarValue::R64(-1.0))
        .unwrap();
    assert!(engine.norm_max_abs("D2").unwrap() < 1e-10);
}

#[test]
fn test_dump_file_round_trip() {
    let engine = engine();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tensor.txt");
    engine
        .create_tensor_sync("A", vec![3, 2], ElementType::Complex64)
        .unwrap();
    engine.init_tensor_rnd("A", 17).unwrap();
    engine
        .write_tensor_file("A", &path, tne::io::DumpLayout::Dense)
        .unwrap();
    engine
        .create_tensor_sync("B", vec![3, 2], ElementType::Complex64)
        .unwrap();
    engine.init_tensor_file("B", &path).unwrap();
    engine
        .add_tensors_sync("B(a,b)+=A(a,b)", ScalarValue::R64(-1.0))
        .unwrap();
    assert!(engine.norm_max_abs("B").unwrap() < 1e-12);
}

#[test]
fn test_planner_memory_ceiling_is_enforced() {
    let engine = engine();
    for (name, shape) in [("P", vec![32, 32]), ("Q", vec![32, 32]), ("R", vec![32, 32])] {
        engine
            .create_tensor_sync(name, shape, ElementType::Complex64)
            .unwrap();
    }
    // No intermediate of a 3-chain fits below 2^2 elements.
    engine.set_memory_ceiling_log2(Some(2.0));
    let network = TensorNetwork::from_symbolic("D(a,b)=P(a,i)*Q(i,j)*R(j,b)", |name| {
        engine.tensor(name).ok()
    })
    .unwrap();
    assert!(matches!(
        engine.evaluate_network(&network),
        Err(TneError::PlannerInfeasible { .. })
    ));
    engine.set_memory_ceiling_log2(None);
    engine.evaluate_network_sync(&network).unwrap();
}
