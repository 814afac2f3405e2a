mod interface;
mod markov_chain;
mod monte_carlo;

pub use interface::{
    Algorithm, AlgorithmContext, AlgorithmOutput, AlgorithmState, IterationResult, Phase, Step,
    TerminationReason,
};
pub use markov_chain::{MarkovChain, MarkovChainSettings};
pub use monte_carlo::{ConvergenceSettings, MonteCarloSettings, RandomMonteCarlo};
