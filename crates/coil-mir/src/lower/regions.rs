// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Protected-region rewriter.
//!
//! Turns the raw regions recorded by the segmenter into descriptors with
//! their cleanup chains, builds the exception tables the runtime dispatches
//! on, and works out which cleanups dispose has to run from each resume
//! state.

use std::cmp::Reverse;
use std::collections::HashMap;

use tracing::debug;

use super::capture::CaptureResult;
use super::descriptor::{CleanupId, ProtectedRegionDescriptor, RegionId, StateId};
use super::segment::{RawRegion, SegmentedBody};
use crate::{ExceptionHandler, ExceptionRegion, LocalId, Place};

#[derive(Debug, Clone)]
pub struct RegionPlan {
    /// Regions of the body, outermost first.
    pub descriptors: Vec<ProtectedRegionDescriptor>,
    pub step_table: Vec<ExceptionRegion>,
    pub cleanup_tables: HashMap<CleanupId, Vec<ExceptionRegion>>,
    /// Cleanups dispose runs when paused in a state, innermost first.
    /// States that need none are absent.
    pub dispose_plan: Vec<(StateId, Vec<CleanupId>)>,
}

pub fn rewrite(seg: &SegmentedBody, captures: &CaptureResult) -> RegionPlan {
    let names: HashMap<CleanupId, &str> =
        seg.cleanups.iter().map(|c| (c.id, c.name.as_str())).collect();
    let resumes: Vec<StateId> = seg.sites.iter().map(|s| s.resume).collect();

    let depths = region_depths(&seg.regions);
    let mut order: Vec<&RawRegion> = seg.regions.iter().collect();
    order.sort_by_key(|r| (depths.get(&r.id).copied().unwrap_or(0), r.id));

    let mut chains: HashMap<RegionId, Vec<CleanupId>> = HashMap::new();
    let mut descriptors = Vec::with_capacity(order.len());
    for region in order {
        let mut chain: Vec<CleanupId> = region.cleanup.into_iter().collect();
        if let Some(parent) = region.parent {
            chain.extend(chains.get(&parent).cloned().unwrap_or_default());
        }
        chains.insert(region.id, chain.clone());
        let spans_boundary = resumes.iter().any(|s| region.covers(*s));
        descriptors.push(ProtectedRegionDescriptor {
            id: region.id,
            parent: region.parent,
            covered: region.start.0..region.end.0,
            handlers: region.handlers.clone(),
            cleanup: region.cleanup,
            cleanup_chain: chain,
            spans_boundary,
            span: region.span,
        });
    }

    let place_of = |local: LocalId| match captures.field_of.get(&local) {
        Some(field) => Place::Field(*field),
        None => Place::Local(local),
    };
    let step_table = exception_table(&seg.regions, &names, &place_of);
    let cleanup_tables = seg
        .cleanups
        .iter()
        .map(|c| (c.id, exception_table(&c.regions, &names, &place_of)))
        .collect();

    let mut dispose_plan = Vec::new();
    for state in &resumes {
        let innermost = descriptors
            .iter()
            .filter(|d| d.cleanup.is_some() && d.covers(*state))
            .min_by_key(|d| d.covered.len());
        if let Some(region) = innermost {
            dispose_plan.push((*state, region.cleanup_chain.clone()));
        }
    }

    debug!(
        regions = descriptors.len(),
        crossing = descriptors.iter().filter(|d| d.spans_boundary).count(),
        dispose_states = dispose_plan.len(),
        "regions rewritten"
    );
    RegionPlan {
        descriptors,
        step_table,
        cleanup_tables,
        dispose_plan,
    }
}

fn region_depths(regions: &[RawRegion]) -> HashMap<RegionId, usize> {
    let parents: HashMap<RegionId, Option<RegionId>> =
        regions.iter().map(|r| (r.id, r.parent)).collect();
    regions
        .iter()
        .map(|r| {
            let mut depth = 0;
            let mut cur = r.parent;
            while let Some(p) = cur {
                depth += 1;
                cur = parents.get(&p).copied().flatten();
            }
            (r.id, depth)
        })
        .collect()
}

/// Exception table for one function, innermost region first.
fn exception_table(
    regions: &[RawRegion],
    names: &HashMap<CleanupId, &str>,
    place_of: &dyn Fn(LocalId) -> Place,
) -> Vec<ExceptionRegion> {
    let depths = region_depths(regions);
    let mut sorted: Vec<&RawRegion> = regions.iter().filter(|r| r.len() > 0).collect();
    sorted.sort_by_key(|r| (r.len(), Reverse(depths.get(&r.id).copied().unwrap_or(0))));
    sorted
        .into_iter()
        .map(|r| ExceptionRegion {
            start: r.start,
            end: r.end,
            handlers: r
                .handlers
                .iter()
                .map(|h| ExceptionHandler {
                    tag: h.tag.clone(),
                    binding: h.binding.map(place_of),
                    filter: h.filter,
                    entry: h.entry,
                })
                .collect(),
            cleanup: r
                .cleanup
                .and_then(|c| names.get(&c))
                .map(|n| n.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::capture::analyze;
    use crate::lower::classify::classify;
    use crate::lower::config::LowerConfig;
    use crate::lower::segment::segment;
    use coil_ast::{BodyBuilder, FnBody, StmtId, Ty};

    fn plan(body: &FnBody) -> (SegmentedBody, RegionPlan) {
        let config = LowerConfig::default();
        let c = classify(body).unwrap();
        let seg = segment(body, &c, &config).unwrap();
        let captures = analyze(body, &seg, &config).unwrap();
        let plan = rewrite(&seg, &captures);
        (seg, plan)
    }

    fn log(b: &mut BodyBuilder) -> StmtId {
        let call = b.call("log", vec![]);
        b.expr(call)
    }

    /// try { try { produce 1 } finally {..}; produce 2 } finally {..}; produce 3
    fn nested() -> FnBody {
        let mut b = BodyBuilder::new("f");
        let one = b.int(1);
        let p1 = b.produce(one);
        let inner_body = b.block(|_| vec![p1]);
        let l1 = log(&mut b);
        let inner_fin = b.block(|_| vec![l1]);
        let inner = b.try_(inner_body, vec![], Some(inner_fin));
        let two = b.int(2);
        let p2 = b.produce(two);
        let outer_body = b.block(|_| vec![inner, p2]);
        let l2 = log(&mut b);
        let outer_fin = b.block(|_| vec![l2]);
        let outer = b.try_(outer_body, vec![], Some(outer_fin));
        let three = b.int(3);
        let p3 = b.produce(three);
        b.finish(vec![outer, p3])
    }

    #[test]
    fn chains_run_innermost_first() {
        let (_, plan) = plan(&nested());
        assert_eq!(plan.descriptors.len(), 2);
        let outer = &plan.descriptors[0];
        let inner = &plan.descriptors[1];
        assert_eq!(outer.parent, None);
        assert_eq!(inner.parent, Some(outer.id));
        assert_eq!(outer.cleanup_chain, vec![CleanupId(0)]);
        assert_eq!(inner.cleanup_chain, vec![CleanupId(1), CleanupId(0)]);
        assert!(outer.spans_boundary && inner.spans_boundary);
    }

    #[test]
    fn table_lists_inner_region_first() {
        let (_, plan) = plan(&nested());
        assert_eq!(plan.step_table.len(), 2);
        assert_eq!(plan.step_table[0].cleanup.as_deref(), Some("f__finally_1"));
        assert_eq!(plan.step_table[1].cleanup.as_deref(), Some("f__finally_0"));
        assert!(plan.step_table[0].len() < plan.step_table[1].len());
    }

    #[test]
    fn dispose_plan_per_resume_state() {
        let (seg, plan) = plan(&nested());
        let resumes: Vec<_> = seg.sites.iter().map(|s| s.resume).collect();
        assert_eq!(
            plan.dispose_plan,
            vec![
                (resumes[0], vec![CleanupId(1), CleanupId(0)]),
                (resumes[1], vec![CleanupId(0)]),
            ]
        );
    }

    #[test]
    fn catch_region_chains_to_finally() {
        let mut b = BodyBuilder::new("f");
        let one = b.int(1);
        let p = b.produce(one);
        let body = b.block(|_| vec![p]);
        let l = log(&mut b);
        let handler = b.block(|_| vec![l]);
        let clause = b.catch(None, None, None, handler);
        let l2 = log(&mut b);
        let fin = b.block(|_| vec![l2]);
        let t = b.try_(body, vec![clause], Some(fin));
        let (_, plan) = plan(&b.finish(vec![t]));

        let inner = &plan.descriptors[1];
        assert_eq!(inner.handlers.len(), 1);
        assert_eq!(inner.cleanup, None);
        assert_eq!(inner.cleanup_chain, vec![CleanupId(0)]);
        assert!(plan.step_table[0].cleanup.is_none());
        assert_eq!(plan.step_table[0].handlers.len(), 1);
    }

    #[test]
    fn captured_binding_is_a_field() {
        let mut b = BodyBuilder::new("f");
        let one = b.int(1);
        let p = b.produce(one);
        let body = b.block(|_| vec![p]);
        let e = b.var("e", Ty::Error);
        let zero = b.int(0);
        let p2 = b.produce(zero);
        let re = b.read(e);
        let logged = b.call("log", vec![re]);
        let ls = b.expr(logged);
        let handler = b.block(|_| vec![p2, ls]);
        let clause = b.catch(None, Some(e), None, handler);
        let t = b.try_(body, vec![clause], None);
        let (_, plan) = plan(&b.finish(vec![t]));

        assert!(matches!(
            plan.step_table[0].handlers[0].binding,
            Some(Place::Field(_))
        ));
    }
}
