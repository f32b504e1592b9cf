//! Reconstruction of a tensor network expansion by an approximant of lower
//! bond dimension.
//!
//! Given a ket expansion `|X>` and a bra approximant `<Y|` with optimizable
//! tensors, minimizes `||X - Y^H||^2` by steepest descent on the Lagrangian
//! `<Y|Y> - <Y|X>`. Gradients with respect to each optimizable tensor are
//! built symbolically as derivative expansions and evaluated by the engine.

use log::debug;
use num_complex::Complex64;

use crate::engine::Engine;
use crate::error::TneError;
use crate::symbolic;
use crate::tensornetwork::expansion::TensorExpansion;
use crate::tensornetwork::network::OUTPUT_TENSOR;
use crate::tensornetwork::tensor::Tensor;
use crate::types::{ElementType, ScalarValue};

/// Iteration cap of the optimization loop.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// Default steepest-descent step size.
pub const DEFAULT_LEARN_RATE: f64 = 0.25;

struct Environment {
    /// Name of the optimizable tensor.
    tensor_name: String,
    /// Identity of its gradient tensor (`_g` prefix).
    gradient: Tensor,
    /// Derivative of the Lagrangian w.r.t. the conjugated tensor.
    gradient_expansion: TensorExpansion,
}

/// Outcome of a reconstruction run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconstruction {
    /// Squared 2-norm of the final residual.
    pub residual_norm2: f64,
    /// Approximation fidelity `|<Y|X>|^2`. Lies in `[0, 1]` when the
    /// reconstructed expansion is normalized.
    pub fidelity: f64,
    /// Number of iterations performed.
    pub iterations: usize,
    /// Whether the gradient tolerance was reached within the iteration cap.
    pub converged: bool,
}

/// Steepest-descent reconstructor of tensor network expansions.
pub struct Reconstructor<'a> {
    engine: &'a Engine,
    expansion: TensorExpansion,
    approximant: TensorExpansion,
    tolerance: f64,
    max_iterations: usize,
    learn_rate: f64,
}

impl<'a> Reconstructor<'a> {
    /// Creates a reconstructor for approximating the ket `expansion` by the
    /// bra `approximant`.
    pub fn new(
        engine: &'a Engine,
        expansion: TensorExpansion,
        approximant: TensorExpansion,
        tolerance: f64,
    ) -> Result<Self, TneError> {
        if !expansion.is_ket() {
            return Err(TneError::ShapeMismatch(
                "the reconstructed expansion must be a ket".to_string(),
            ));
        }
        if !approximant.is_bra() {
            return Err(TneError::ShapeMismatch(
                "the approximant must be a bra".to_string(),
            ));
        }
        if expansion.rank() != approximant.rank() {
            return Err(TneError::ShapeMismatch(format!(
                "rank mismatch: expansion {} vs approximant {}",
                expansion.rank(),
                approximant.rank()
            )));
        }
        Ok(Self {
            engine,
            expansion,
            approximant,
            tolerance,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            learn_rate: DEFAULT_LEARN_RATE,
        })
    }

    /// Overrides the iteration cap.
    pub fn reset_max_iterations(&mut self, max_iterations: usize) {
        self.max_iterations = max_iterations;
    }

    /// Overrides the step size.
    pub fn reset_learn_rate(&mut self, learn_rate: f64) {
        self.learn_rate = learn_rate;
    }

    /// Evaluates a scalar expansion and reads back the modulus of its value.
    fn eval_scalar(&self, expansion: &TensorExpansion) -> Result<f64, TneError> {
        let scalar = "_scalar_norm";
        self.engine.init_tensor_sync(scalar, ScalarValue::R64(0.0))?;
        self.engine.evaluate_expansion_sync(expansion, scalar, 1)?;
        self.engine.norm1(scalar)
    }

    /// Runs the optimization until the maximum gradient magnitude falls below
    /// the tolerance or the iteration cap is hit.
    pub fn reconstruct(&mut self) -> Result<Reconstruction, TneError> {
        // Lagrangian <Y|Y> - <Y|X> and the residual functional
        // <X|X> + <Y|Y> - <Y|X> - <X|Y>.
        let mut approximant_ket = self.approximant.clone();
        approximant_ket.conjugate();
        let mut expansion_bra = self.expansion.clone();
        expansion_bra.conjugate();

        let mut overlap = TensorExpansion::inner_product(&self.approximant, &self.expansion)?;
        overlap.rename("Overlap");
        let mut normalization =
            TensorExpansion::inner_product(&self.approximant, &approximant_ket)?;
        normalization.rename("Normalization");
        let mut input_norm = TensorExpansion::inner_product(&expansion_bra, &self.expansion)?;
        input_norm.rename("InputNorm");
        let mut overlap_conj = TensorExpansion::inner_product(&expansion_bra, &approximant_ket)?;
        overlap_conj.rename("OverlapConj");

        let one = Complex64::new(1.0, 0.0);
        let mut lagrangian = TensorExpansion::new_ket("Lagrangian");
        lagrangian.append_expansion(&normalization, one)?;
        lagrangian.append_expansion(&overlap, -one)?;
        let mut residual = TensorExpansion::new_ket("Residual");
        residual.append_expansion(&input_norm, one)?;
        residual.append_expansion(&normalization, one)?;
        residual.append_expansion(&overlap, -one)?;
        residual.append_expansion(&overlap_conj, -one)?;

        // One derivative environment per unique optimizable tensor.
        let mut environments: Vec<Environment> = Vec::new();
        for component in self.approximant.iter() {
            for conn in component.network.iter() {
                if conn.id() == OUTPUT_TENSOR || !conn.is_optimizable() {
                    continue;
                }
                let name = conn.tensor().name().to_string();
                if environments.iter().any(|env| env.tensor_name == name) {
                    continue;
                }
                let mut gradient = conn.tensor().clone();
                gradient.rename(format!("_g{name}"));
                environments.push(Environment {
                    tensor_name: name.clone(),
                    gradient,
                    gradient_expansion: lagrangian.derivative(&name, true)?,
                });
            }
        }
        if environments.is_empty() {
            return Err(TneError::ShapeMismatch(
                "the approximant has no optimizable tensors".to_string(),
            ));
        }
        debug!(environments = environments.len(); "prepared derivative environments");

        self.engine
            .create_tensor_sync("_scalar_norm", vec![], ElementType::Complex64)?;
        let input_norm2 = self.eval_scalar(&input_norm)?;

        let mut iterations = 0;
        let mut converged = false;
        let mut residual_norm2 = f64::INFINITY;
        while !converged && iterations < self.max_iterations {
            iterations += 1;
            let mut max_grad = 0f64;
            for environment in &environments {
                let gradient_name = environment.gradient.name().to_string();
                self.engine.create_tensor_in_group(
                    environment.gradient.clone(),
                    ElementType::Complex64,
                    crate::runtime::process_group::WORLD_GROUP,
                )?;
                self.engine.evaluate_expansion_sync(
                    &environment.gradient_expansion,
                    &gradient_name,
                    1,
                )?;
                let grad_maxabs = self.engine.norm_max_abs(&gradient_name)?;
                max_grad = max_grad.max(grad_maxabs);
                if grad_maxabs > self.tolerance {
                    let pattern = symbolic::addition_pattern(
                        environment.gradient.rank(),
                        &environment.tensor_name,
                        &gradient_name,
                        false,
                    );
                    self.engine
                        .add_tensors_sync(&pattern, ScalarValue::R64(-self.learn_rate))?;
                }
                self.engine.destroy_tensor_sync(&gradient_name)?;
            }
            residual_norm2 = self.eval_scalar(&residual)?;
            converged = max_grad <= self.tolerance;
            debug!(
                iteration = iterations,
                max_grad,
                residual = residual_norm2;
                "reconstruction step"
            );
            // Each iteration retires hundreds of settled DAG nodes; prune
            // them so the ready scan stays proportional to one iteration.
            self.engine.sync_all(true)?;
        }

        // Approximation fidelity |<Y|X>|^2.
        let output_norm2 = self.eval_scalar(&normalization)?;
        let overlap_abs = self.eval_scalar(&overlap)?;
        let fidelity = overlap_abs * overlap_abs;
        debug!(
            input_norm = input_norm2.sqrt(),
            output_norm = output_norm2.sqrt(),
            overlap = overlap_abs;
            "reconstruction summary"
        );
        self.engine.destroy_tensor_sync("_scalar_norm")?;

        Ok(Reconstruction {
            residual_norm2,
            fidelity,
            iterations,
            converged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::EngineConfig;
    use crate::tensornetwork::network::TensorNetwork;

    #[test]
    fn test_side_validation() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let ket = TensorExpansion::new_ket("X");
        let bra = TensorExpansion::new_bra("Y");
        assert!(Reconstructor::new(&engine, ket.clone(), ket.clone(), 1e-6).is_err());
        assert!(Reconstructor::new(&engine, bra.clone(), bra.clone(), 1e-6).is_err());
        assert!(Reconstructor::new(&engine, ket, bra, 1e-6).is_ok());
    }

    #[test]
    fn test_reconstruct_matrix_exactly() {
        // A single-tensor approximant makes the functional exactly quadratic
        // in W, so the descent converges to W = M * N and the reported
        // fidelity is exactly |<X|X>|^2.
        let engine = Engine::new(EngineConfig::default()).unwrap();
        for (name, seed) in [("M", 3u64), ("N", 5u64), ("W", 9u64)] {
            engine
                .create_tensor_sync(name, vec![2, 2], ElementType::Complex64)
                .unwrap();
            engine.init_tensor_rnd(name, seed).unwrap();
        }
        engine.sync_all(false).unwrap();

        let resolver = |name: &str| engine.tensor(name).ok();
        let target = TensorNetwork::from_symbolic("X(a,b)=M(a,i)*N(i,b)", resolver).unwrap();
        let mut expansion = TensorExpansion::new_ket("Xexp");
        expansion
            .append_network(target, Complex64::new(1.0, 0.0))
            .unwrap();

        let approx_net = TensorNetwork::from_symbolic("Y(a,b)=W(a,b)", resolver).unwrap();
        let mut approximant = TensorExpansion::new_ket("Yexp");
        approximant
            .append_network(approx_net, Complex64::new(1.0, 0.0))
            .unwrap();
        approximant.reset_optimizability("W", true);
        approximant.conjugate();

        let mut reconstructor =
            Reconstructor::new(&engine, expansion, approximant, 1e-4).unwrap();
        reconstructor.reset_max_iterations(1000);
        reconstructor.reset_learn_rate(0.1);
        let outcome = reconstructor.reconstruct().unwrap();
        assert!(outcome.converged);
        assert!(outcome.residual_norm2 <= 1e-4);

        // At the optimum the overlap equals <X|X> = ||M*N||^2, so the
        // unnormalized fidelity is that value squared.
        engine
            .create_tensor_sync("MN", vec![2, 2], ElementType::Complex64)
            .unwrap();
        engine
            .contract_tensors_sync("MN(a,b)+=M(a,i)*N(i,b)", ScalarValue::R64(1.0))
            .unwrap();
        let target_norm = engine.norm2("MN").unwrap();
        let expected = target_norm.powi(4);
        assert!((outcome.fidelity - expected).abs() <= 1e-2 * expected.max(1.0));
    }
}
