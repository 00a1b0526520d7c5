//! Turns a validated skillset into a runnable [`Pipeline`].
//!
//! Assembly builds every skill through the registry and then checks the
//! chain: it must start with a source, nothing may follow a sink, and each
//! skill must accept the shape flowing into it. A pass-through transform
//! forwards the shape it receives. Any failure closes the skills already
//! built.

use crate::config::Skillset;
use crate::error::{IndexerError, Result};
use crate::registry::SkillRegistry;
use crate::skills::{Shape, SkillInstance, SkillKind};

/// An ordered, contract-checked list of skill instances.
#[derive(Debug)]
pub struct Pipeline {
    pub skillset: String,
    pub stages: Vec<SkillInstance>,
}

impl Pipeline {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Labels of every stage, in order.
    pub fn labels(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.label()).collect()
    }

    /// Shape flowing into each stage; `None` for the source.
    pub fn input_shapes(&self) -> Vec<Option<Shape>> {
        let mut shapes = Vec::with_capacity(self.stages.len());
        let mut flowing: Option<Shape> = None;
        for stage in &self.stages {
            shapes.push(flowing);
            let contract = stage.contract();
            flowing = match flowing {
                Some(shape) => contract.output(shape),
                None => contract.produces,
            };
        }
        shapes
    }

    /// Whether any stage receives whole documents, so a tracker can see them.
    pub fn tracks_documents(&self) -> bool {
        self.input_shapes().contains(&Some(Shape::Document))
    }

    pub async fn close_all(&self) {
        for stage in &self.stages {
            stage.close().await;
        }
    }
}

pub async fn assemble(skillset: &Skillset, registry: &SkillRegistry) -> Result<Pipeline> {
    let mut stages: Vec<SkillInstance> = Vec::with_capacity(skillset.skills.len());

    for def in &skillset.skills {
        match registry.build(def) {
            Ok(kind) => stages.push(SkillInstance {
                definition: def.clone(),
                kind,
            }),
            Err(e) => {
                close(&stages).await;
                return Err(e);
            }
        }
    }

    if let Err(e) = check_chain(&stages) {
        close(&stages).await;
        return Err(e);
    }

    tracing::debug!(
        skillset = %skillset.id,
        stages = ?stages.iter().map(|s| s.label()).collect::<Vec<_>>(),
        "pipeline assembled"
    );

    Ok(Pipeline {
        skillset: skillset.id.clone(),
        stages,
    })
}

async fn close(stages: &[SkillInstance]) {
    for s in stages {
        s.close().await;
    }
}

fn incompatible(upstream: &str, downstream: &str, produced: &str, accepted: String) -> IndexerError {
    IndexerError::IncompatiblePipeline {
        upstream: upstream.to_string(),
        downstream: downstream.to_string(),
        produced: produced.to_string(),
        accepted,
    }
}

fn check_chain(stages: &[SkillInstance]) -> Result<()> {
    let Some(first) = stages.first() else {
        return Err(incompatible("(start)", "(end)", "nothing", "a source".to_string()));
    };
    if !matches!(first.kind, SkillKind::Source(_)) {
        return Err(incompatible(
            "(start)",
            &first.label(),
            "nothing",
            first.contract().describe_accepts(),
        ));
    }

    let mut flowing = first.contract().produces;
    for pair in stages.windows(2) {
        let (up, down) = (&pair[0], &pair[1]);
        let up_label = up.label();
        let down_label = down.label();
        let contract = down.contract();
        let accepted = contract.describe_accepts();

        if matches!(down.kind, SkillKind::Source(_)) {
            return Err(incompatible(&up_label, &down_label, "items", accepted));
        }
        let Some(shape) = flowing else {
            return Err(incompatible(&up_label, &down_label, "nothing", accepted));
        };
        if !contract.accepts(shape) {
            return Err(incompatible(&up_label, &down_label, &shape.to_string(), accepted));
        }
        flowing = contract.output(shape);
    }
    Ok(())
}
