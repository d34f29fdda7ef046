//! # Lowering Pipeline
//!
//! Drives a type-checked tree through the lowering passes in order:
//!
//! 1. implicit conversion exposure (when enabled)
//! 2. trait erasure
//! 3. union erasure
//! 4. expression decomposition
//! 5. Eseq erasure
//!
//! Every stage shares the same [`Environment`], so temporary names stay
//! unique across the whole pipeline and types registered by one stage (the
//! tagged-union structs, the trait-object structs) are visible to the next.

use log::{debug, log_enabled, trace, Level};
use serde::{Deserialize, Serialize};
use snap_typed_ast::layout::LayoutKind;
use snap_typed_ast::{CompilerError, CompilerResult, Environment, Node};

use crate::decompose::decompose;
use crate::erase_eseq::{erase_eseq, EraseEseqOptions};
use crate::erase_unions::erase_unions;
use crate::expose_conversions::expose_conversions;
use crate::vtables::vtables;

/// Pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoweringConfig {
    /// Leave an Eseq in a while-loop condition instead of failing
    pub ignore_while_condition_eseq: bool,
    /// Run the implicit conversion exposure stage first
    pub expose_implicit_conversions: bool,
    /// Memory layout the environment must have been built with
    pub layout: LayoutKind,
}

impl LoweringConfig {
    pub fn erase_eseq_options(&self) -> EraseEseqOptions {
        EraseEseqOptions {
            ignore_while_condition_eseq: self.ignore_while_condition_eseq,
        }
    }
}

/// One step of the pipeline
pub trait LoweringStage: Send + Sync {
    /// Name of this stage, as it appears in logs
    fn name(&self) -> &'static str;

    /// Rewrite the whole tree
    fn run(&mut self, env: &mut Environment, node: Node) -> CompilerResult<Node>;
}

struct ExposeConversionsStage;

impl LoweringStage for ExposeConversionsStage {
    fn name(&self) -> &'static str {
        "expose-conversions"
    }

    fn run(&mut self, env: &mut Environment, node: Node) -> CompilerResult<Node> {
        expose_conversions(env, node)
    }
}

struct VtablesStage;

impl LoweringStage for VtablesStage {
    fn name(&self) -> &'static str {
        "vtables"
    }

    fn run(&mut self, env: &mut Environment, node: Node) -> CompilerResult<Node> {
        vtables(env, node)
    }
}

struct EraseUnionsStage;

impl LoweringStage for EraseUnionsStage {
    fn name(&self) -> &'static str {
        "erase-unions"
    }

    fn run(&mut self, env: &mut Environment, node: Node) -> CompilerResult<Node> {
        erase_unions(env, node)
    }
}

struct DecomposeStage;

impl LoweringStage for DecomposeStage {
    fn name(&self) -> &'static str {
        "decompose"
    }

    fn run(&mut self, env: &mut Environment, node: Node) -> CompilerResult<Node> {
        decompose(env, node)
    }
}

struct EraseEseqStage {
    options: EraseEseqOptions,
}

impl LoweringStage for EraseEseqStage {
    fn name(&self) -> &'static str {
        "erase-eseq"
    }

    fn run(&mut self, env: &mut Environment, node: Node) -> CompilerResult<Node> {
        erase_eseq(env, node, self.options)
    }
}

pub struct LoweringPipeline {
    stages: Vec<Box<dyn LoweringStage>>,
    config: LoweringConfig,
}

impl LoweringPipeline {
    pub fn new(config: LoweringConfig) -> Self {
        let mut pipeline = Self {
            stages: Vec::new(),
            config,
        };
        pipeline.add_default_stages();
        pipeline
    }

    fn add_default_stages(&mut self) {
        if self.config.expose_implicit_conversions {
            self.stages.push(Box::new(ExposeConversionsStage));
        }
        self.stages.push(Box::new(VtablesStage));
        self.stages.push(Box::new(EraseUnionsStage));
        self.stages.push(Box::new(DecomposeStage));
        self.stages.push(Box::new(EraseEseqStage {
            options: self.config.erase_eseq_options(),
        }));
    }

    /// Append a stage after the default ones
    pub fn add_stage(&mut self, stage: Box<dyn LoweringStage>) {
        self.stages.push(stage);
    }

    pub fn config(&self) -> &LoweringConfig {
        &self.config
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// A fresh environment using the configured layout
    pub fn environment(&self) -> Environment {
        Environment::with_layout(self.config.layout)
    }

    /// Lower `tree` through every stage
    pub fn run(&mut self, env: &mut Environment, tree: Node) -> CompilerResult<Node> {
        if env.layout_kind() != self.config.layout {
            return Err(CompilerError::internal(
                format!(
                    "environment uses the {:?} layout but the pipeline is configured for {:?}",
                    env.layout_kind(),
                    self.config.layout
                ),
                tree.span,
            ));
        }
        let mut tree = tree;
        for stage in &mut self.stages {
            debug!("[PIPELINE] running {}", stage.name());
            tree = stage.run(env, tree)?;
            if log_enabled!(Level::Trace) {
                match tree.to_json() {
                    Ok(json) => trace!("[PIPELINE] after {}: {}", stage.name(), json),
                    Err(e) => trace!("[PIPELINE] after {}: unable to dump tree: {}", stage.name(), e),
                }
            }
        }
        debug!("[PIPELINE] lowered tree through {} stages", self.stages.len());
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stage_order() {
        let pipeline = LoweringPipeline::new(LoweringConfig::default());
        assert_eq!(
            pipeline.stage_names(),
            vec!["vtables", "erase-unions", "decompose", "erase-eseq"]
        );

        let pipeline = LoweringPipeline::new(LoweringConfig {
            expose_implicit_conversions: true,
            ..LoweringConfig::default()
        });
        assert_eq!(pipeline.stage_names()[0], "expose-conversions");
        assert_eq!(pipeline.stage_names().len(), 5);
    }

    #[test]
    fn test_config_from_json() {
        let config: LoweringConfig = serde_json::from_str(r#"{ "ignore_while_condition_eseq": true }"#).unwrap();
        assert!(config.ignore_while_condition_eseq);
        assert!(!config.expose_implicit_conversions);
        assert_eq!(config.layout, LayoutKind::Turtle16);
        assert!(config.erase_eseq_options().ignore_while_condition_eseq);
    }
}
