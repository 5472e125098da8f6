//! Pareto-frontier winner selection over quality and cost.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParetoPolicy {
    PreferCheap,
    PreferQuality,
    Balanced,
}

/// Scoring used by the `balanced` policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatioFormula {
    /// `quality / (cost + epsilon)`.
    QualityPerCost { epsilon: f64 },
    /// `w * quality + (1 - w) * (1 - cost)` over min-max normalized values.
    Weighted { quality_weight: f64 },
}

impl Default for RatioFormula {
    fn default() -> Self {
        RatioFormula::QualityPerCost { epsilon: 1e-6 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParetoSpec {
    pub policy: ParetoPolicy,
    #[serde(default)]
    pub ratio: RatioFormula,
}

/// One candidate's position in quality/cost space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub quality: f64,
    pub cost: f64,
}

impl Point {
    pub fn new(quality: f64, cost: f64) -> Self {
        Self { quality, cost }
    }

    fn dominates(&self, other: &Point) -> bool {
        self.quality >= other.quality
            && self.cost <= other.cost
            && (self.quality > other.quality || self.cost < other.cost)
    }
}

/// Indices of the non-dominated points, ascending.
pub fn frontier(points: &[Point]) -> Vec<usize> {
    (0..points.len())
        .filter(|&i| !points.iter().any(|other| other.dominates(&points[i])))
        .collect()
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max > min { (value - min) / (max - min) } else { 1.0 }
}

/// Pick a point from the frontier under `spec`. Ties go to the lowest index.
pub fn pick(spec: &ParetoSpec, points: &[Point]) -> Option<usize> {
    let front = frontier(points);
    let fold = |score: &dyn Fn(&Point) -> f64| {
        let mut best: Option<(usize, f64)> = None;
        for &i in &front {
            let s = score(&points[i]);
            if best.is_none_or(|(_, top)| s > top) {
                best = Some((i, s));
            }
        }
        best.map(|(i, _)| i)
    };

    match spec.policy {
        // on the frontier, cheaper never means better quality, so the
        // cheapest member is unique up to exact duplicates
        ParetoPolicy::PreferCheap => fold(&|p| -p.cost),
        ParetoPolicy::PreferQuality => fold(&|p| p.quality),
        ParetoPolicy::Balanced => match spec.ratio {
            RatioFormula::QualityPerCost { epsilon } => fold(&|p| p.quality / (p.cost + epsilon)),
            RatioFormula::Weighted { quality_weight } => {
                let w = quality_weight.clamp(0.0, 1.0);
                let (qmin, qmax) = bounds(points.iter().map(|p| p.quality));
                let (cmin, cmax) = bounds(points.iter().map(|p| p.cost));
                fold(&|p| {
                    w * normalize(p.quality, qmin, qmax)
                        + (1.0 - w) * (1.0 - normalize(p.cost, cmin, cmax))
                })
            }
        },
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points() -> Vec<Point> {
        vec![
            Point::new(0.9, 10.0), // best quality, expensive
            Point::new(0.5, 1.0),  // cheap
            Point::new(0.4, 5.0),  // dominated by 1
            Point::new(0.8, 2.0),  // good ratio
        ]
    }

    fn spec(policy: ParetoPolicy, ratio: RatioFormula) -> ParetoSpec {
        ParetoSpec { policy, ratio }
    }

    #[test]
    fn test_frontier_excludes_dominated() {
        assert_eq!(frontier(&points()), vec![0, 1, 3]);
    }

    #[test]
    fn test_prefer_cheap_and_quality() {
        let p = points();
        assert_eq!(pick(&spec(ParetoPolicy::PreferCheap, RatioFormula::default()), &p), Some(1));
        assert_eq!(pick(&spec(ParetoPolicy::PreferQuality, RatioFormula::default()), &p), Some(0));
    }

    #[test]
    fn test_balanced_honours_formula() {
        let p = points();
        // 0.5/1 = 0.5 beats 0.8/2 = 0.4 and 0.9/10
        assert_eq!(pick(&spec(ParetoPolicy::Balanced, RatioFormula::default()), &p), Some(1));
        // quality-heavy weighting moves to the strong, moderately priced candidate
        let weighted = RatioFormula::Weighted { quality_weight: 0.8 };
        assert_eq!(pick(&spec(ParetoPolicy::Balanced, weighted), &p), Some(3));
    }

    #[test]
    fn test_identical_points_pick_lowest_index() {
        let p = vec![Point::new(1.0, 1.0), Point::new(1.0, 1.0)];
        assert_eq!(frontier(&p), vec![0, 1]);
        assert_eq!(pick(&spec(ParetoPolicy::Balanced, RatioFormula::default()), &p), Some(0));
    }

    #[test]
    fn test_ratio_deserializes() {
        let spec: ParetoSpec = serde_yaml::from_str(
            "policy: balanced\nratio:\n  weighted:\n    quality_weight: 0.7\n",
        )
        .unwrap();
        assert_eq!(spec.ratio, RatioFormula::Weighted { quality_weight: 0.7 });
        let spec: ParetoSpec = serde_json::from_str(r#"{"policy": "prefer_cheap"}"#).unwrap();
        assert_eq!(spec.ratio, RatioFormula::default());
    }
}
