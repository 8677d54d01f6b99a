//! Tree ensembles for failure probability and health index
//!
//! Ensembles are serialized as JSON together with the instance header they
//! were fitted on. Each tree is a flat node list rooted at index 0; a
//! classification leaf stores a class distribution, a regression leaf a
//! single value. The ensemble prediction is the average over trees.

use super::ModelError;
use crate::models::{FEATURE_NAMES, NUM_FEATURES};
use serde::{Deserialize, Serialize};

/// Label of the positive class in the failure header
pub const FAILURE_CLASS: &str = "failure";

/// Target attribute of an instance header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetAttribute {
    Nominal { name: String, values: Vec<String> },
    Numeric { name: String },
}

/// Schema of a flat tree-model instance: feature columns then the target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeader {
    pub relation: String,
    pub attributes: Vec<String>,
    pub target: TargetAttribute,
}

impl InstanceHeader {
    pub fn failure_default() -> Self {
        Self {
            relation: "failure_data".to_string(),
            attributes: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            target: TargetAttribute::Nominal {
                name: "class".to_string(),
                values: vec!["normal".to_string(), FAILURE_CLASS.to_string()],
            },
        }
    }

    pub fn health_index_default() -> Self {
        Self {
            relation: "health_index_data".to_string(),
            attributes: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            target: TargetAttribute::Numeric {
                name: "health_index".to_string(),
            },
        }
    }

    /// Position of the target slot in an instance
    pub fn class_index(&self) -> usize {
        self.attributes.len()
    }

    pub fn num_attributes(&self) -> usize {
        self.attributes.len() + 1
    }

    /// Number of values a leaf must carry
    fn leaf_width(&self) -> usize {
        match &self.target {
            TargetAttribute::Nominal { values, .. } => values.len(),
            TargetAttribute::Numeric { .. } => 1,
        }
    }

    fn check_features(&self) -> Result<(), ModelError> {
        let matches = self.attributes.len() == NUM_FEATURES
            && self.attributes.iter().zip(FEATURE_NAMES.iter()).all(|(a, b)| a == b);
        if matches {
            Ok(())
        } else {
            Err(ModelError::Malformed(format!(
                "header '{}' feature order {:?} does not match {:?}",
                self.relation, self.attributes, FEATURE_NAMES
            )))
        }
    }
}

/// A normalized feature row with a missing target slot
#[derive(Debug, Clone)]
pub struct FlatInstance<'a> {
    header: &'a InstanceHeader,
    values: Vec<f64>,
}

impl<'a> FlatInstance<'a> {
    pub fn new(header: &'a InstanceHeader, features: &[f64]) -> Self {
        let mut values = features.to_vec();
        values.push(f64::NAN);
        Self { header, values }
    }

    pub fn header(&self) -> &InstanceHeader {
        self.header
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn class_index(&self) -> usize {
        self.header.class_index()
    }

    pub fn is_missing(&self, index: usize) -> bool {
        self.values.get(index).map_or(true, |v| v.is_nan())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: Vec<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    pub fn new(nodes: Vec<TreeNode>) -> Self {
        Self { nodes }
    }

    fn leaf(&self, values: &[f64]) -> Result<&[f64], ModelError> {
        let mut index = 0;
        // a well-formed tree reaches a leaf in fewer hops than it has nodes
        for _ in 0..self.nodes.len() {
            match self.nodes.get(index) {
                Some(TreeNode::Leaf { value }) => return Ok(value.as_slice()),
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let v = values.get(*feature).copied().unwrap_or(f64::NAN);
                    // missing values follow the right branch
                    index = if v <= *threshold { *left } else { *right };
                }
                None => break,
            }
        }
        Err(ModelError::Malformed(format!("tree walk did not reach a leaf (node {})", index)))
    }

    fn validate(&self, class_index: usize, leaf_width: usize) -> Result<(), ModelError> {
        if self.nodes.is_empty() {
            return Err(ModelError::Malformed("tree has no nodes".to_string()));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature, left, right, ..
                } => {
                    if *feature >= class_index {
                        return Err(ModelError::Malformed(format!(
                            "node {} splits on column {} outside the feature columns",
                            i, feature
                        )));
                    }
                    if *left >= self.nodes.len() || *right >= self.nodes.len() {
                        return Err(ModelError::Malformed(format!("node {} has a dangling child", i)));
                    }
                }
                TreeNode::Leaf { value } => {
                    if value.len() != leaf_width {
                        return Err(ModelError::Malformed(format!(
                            "leaf {} carries {} values, expected {}",
                            i,
                            value.len(),
                            leaf_width
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Forest of decision trees bound to an instance header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub header: InstanceHeader,
    #[serde(default)]
    pub trees: Vec<DecisionTree>,
}

impl TreeEnsemble {
    pub fn new(header: InstanceHeader, trees: Vec<DecisionTree>) -> Self {
        Self { header, trees }
    }

    /// An ensemble with the right schema but no trees
    pub fn untrained(header: InstanceHeader) -> Self {
        Self::new(header, Vec::new())
    }

    pub fn is_trained(&self) -> bool {
        !self.trees.is_empty()
    }

    pub fn header(&self) -> &InstanceHeader {
        &self.header
    }

    /// Check the feature order, target and every tree
    pub fn validate(&self) -> Result<(), ModelError> {
        self.header.check_features()?;
        if let TargetAttribute::Nominal { values, .. } = &self.header.target {
            if values.is_empty() {
                return Err(ModelError::Malformed("nominal target has no values".to_string()));
            }
        }
        if !self.is_trained() {
            return Err(ModelError::Malformed("ensemble has no trees".to_string()));
        }
        let class_index = self.header.class_index();
        let leaf_width = self.header.leaf_width();
        for tree in &self.trees {
            tree.validate(class_index, leaf_width)?;
        }
        Ok(())
    }

    fn check_instance(&self, instance: &FlatInstance<'_>) -> Result<(), ModelError> {
        if !self.is_trained() {
            return Err(ModelError::Untrained(self.header.relation.clone()));
        }
        if instance.values().len() != self.header.num_attributes() {
            return Err(ModelError::ShapeMismatch {
                expected: vec![self.header.num_attributes()],
                got: vec![instance.values().len()],
            });
        }
        Ok(())
    }

    /// Averaged class distribution for a nominal target
    pub fn distribution_for(&self, instance: &FlatInstance<'_>) -> Result<Vec<f64>, ModelError> {
        self.check_instance(instance)?;
        let width = match &self.header.target {
            TargetAttribute::Nominal { values, .. } => values.len(),
            TargetAttribute::Numeric { name } => {
                return Err(ModelError::Malformed(format!(
                    "target '{}' is numeric, no class distribution",
                    name
                )))
            }
        };

        let mut totals = vec![0.0; width];
        for tree in &self.trees {
            let leaf = tree.leaf(instance.values())?;
            let sum: f64 = leaf.iter().sum();
            for (total, v) in totals.iter_mut().zip(leaf) {
                *total += if sum > 0.0 { v / sum } else { 1.0 / width as f64 };
            }
        }
        let n = self.trees.len() as f64;
        Ok(totals.into_iter().map(|t| t / n).collect())
    }

    /// Probability of one class label
    pub fn class_probability(&self, instance: &FlatInstance<'_>, label: &str) -> Result<f64, ModelError> {
        let index = match &self.header.target {
            TargetAttribute::Nominal { values, .. } => values.iter().position(|v| v == label),
            TargetAttribute::Numeric { .. } => None,
        }
        .ok_or_else(|| ModelError::Malformed(format!("target has no class '{}'", label)))?;
        let distribution = self.distribution_for(instance)?;
        Ok(distribution[index])
    }

    /// Regression value (numeric target) or most likely class index (nominal target)
    pub fn classify(&self, instance: &FlatInstance<'_>) -> Result<f64, ModelError> {
        self.check_instance(instance)?;
        match &self.header.target {
            TargetAttribute::Numeric { .. } => {
                let mut total = 0.0;
                for tree in &self.trees {
                    total += tree.leaf(instance.values())?[0];
                }
                Ok(total / self.trees.len() as f64)
            }
            TargetAttribute::Nominal { .. } => {
                let distribution = self.distribution_for(instance)?;
                let best = distribution
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best });
                Ok(best.0 as f64)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn features(current: f64, gas: f64) -> Vec<f64> {
        let mut f = vec![0.0; NUM_FEATURES];
        f[8] = current;
        f[10] = gas;
        f
    }

    #[test]
    fn test_instance_has_missing_target_slot() {
        let header = InstanceHeader::failure_default();
        let instance = FlatInstance::new(&header, &features(0.0, 0.0));
        assert_eq!(instance.values().len(), 12);
        assert_eq!(instance.class_index(), 11);
        assert!(instance.is_missing(11));
        assert!(!instance.is_missing(0));
    }

    #[test]
    fn test_failure_distribution_averages_trees() {
        let forest = failure_forest();
        forest.validate().unwrap();
        let header = forest.header().clone();

        let low = FlatInstance::new(&header, &features(0.5, 0.0));
        let dist = forest.distribution_for(&low).unwrap();
        assert!((dist[1] - 0.05).abs() < 1e-12);

        let high = FlatInstance::new(&header, &features(3.0, 0.0));
        let p = forest.class_probability(&high, FAILURE_CLASS).unwrap();
        assert!((p - 0.9).abs() < 1e-12);
        assert_eq!(forest.classify(&high).unwrap(), 1.0);
    }

    #[test]
    fn test_health_regression_mean() {
        let forest = health_forest();
        let header = forest.header().clone();
        let healthy = FlatInstance::new(&header, &features(0.0, 0.1));
        assert!((forest.classify(&healthy).unwrap() - 85.0).abs() < 1e-12);
        let leaking = FlatInstance::new(&header, &features(0.0, 0.9));
        assert!((forest.classify(&leaking).unwrap() - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_untrained_ensemble_errors() {
        let forest = TreeEnsemble::untrained(InstanceHeader::failure_default());
        let header = forest.header().clone();
        let instance = FlatInstance::new(&header, &features(0.0, 0.0));
        assert!(matches!(
            forest.distribution_for(&instance),
            Err(ModelError::Untrained(_))
        ));
    }

    #[test]
    fn test_validate_rejects_reordered_features() {
        let mut forest = failure_forest();
        forest.header.attributes.swap(0, 1);
        assert!(matches!(forest.validate(), Err(ModelError::Malformed(_))));
    }

    #[test]
    fn test_validate_rejects_split_on_target() {
        let forest = TreeEnsemble::new(
            InstanceHeader::health_index_default(),
            vec![stump(11, 0.0, vec![1.0], vec![2.0])],
        );
        assert!(forest.validate().is_err());
    }

    #[test]
    fn test_cyclic_tree_does_not_hang() {
        let tree = DecisionTree::new(vec![TreeNode::Split {
            feature: 0,
            threshold: 0.0,
            left: 0,
            right: 0,
        }]);
        assert!(tree.leaf(&[1.0]).is_err());
    }

    #[test]
    fn test_json_round_trip_shape() {
        let json = serde_json::to_value(health_forest()).unwrap();
        assert_eq!(json["header"]["target"]["type"], "numeric");
        assert_eq!(json["trees"][0]["nodes"][0]["node"], "split");
    }
}
