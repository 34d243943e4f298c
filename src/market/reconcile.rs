use crate::market::types::{
    Category, Pool, PoolUpdate, SortDirection, SortField, SortSpec, CATEGORY_LIST_CAPACITY,
};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryList {
    pub pools: Vec<Pool>,
    pub sort: Option<SortSpec>,
}

impl CategoryList {
    /// Duplicate ids keep their first occurrence.
    pub fn from_pools(category: Category, pools: Vec<Pool>, sort: Option<SortSpec>) -> Self {
        let mut deduped: Vec<Pool> = Vec::with_capacity(pools.len());
        for pool in pools {
            if !deduped.iter().any(|existing| existing.id == pool.id) {
                deduped.push(pool);
            }
        }
        let mut list = Self {
            pools: deduped,
            sort,
        };
        list.finalize(category);
        list
    }

    pub fn active_sort(&self, category: Category) -> SortSpec {
        self.sort.unwrap_or_else(|| category.default_sort())
    }

    pub fn contains(&self, pool_id: &str) -> bool {
        self.position(pool_id).is_some()
    }

    fn position(&self, pool_id: &str) -> Option<usize> {
        self.pools.iter().position(|pool| pool.id == pool_id)
    }

    fn remove(&mut self, pool_id: &str) {
        self.pools.retain(|pool| pool.id != pool_id);
    }

    fn patch(&mut self, incoming: &Pool) -> bool {
        match self.position(&incoming.id) {
            Some(index) => {
                self.pools[index].merge_from(incoming);
                true
            }
            None => false,
        }
    }

    fn patch_or_append(&mut self, incoming: &Pool) {
        if !self.patch(incoming) {
            self.pools.push(Pool::streamed_copy(incoming));
        }
    }

    // Scanned every time: admissions and patches inside a batch leave the
    // list unsorted until `finalize`.
    fn min_bonding_curve(&self) -> Option<f64> {
        self.pools
            .iter()
            .filter_map(|pool| pool.bonding_curve)
            .min_by(|left, right| left.total_cmp(right))
    }

    fn admits(&self, incoming: &Pool) -> bool {
        if self.pools.len() < CATEGORY_LIST_CAPACITY {
            return true;
        }
        match (incoming.bonding_curve, self.min_bonding_curve()) {
            (Some(candidate), Some(minimum)) => candidate > minimum,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn patch_or_admit(&mut self, incoming: &Pool, in_graduated: bool) {
        if incoming.base_asset.is_graduated() {
            return;
        }
        if self.patch(incoming) {
            return;
        }
        if !in_graduated && self.admits(incoming) {
            self.pools.push(Pool::streamed_copy(incoming));
        }
    }

    fn finalize(&mut self, category: Category) {
        let sort = self.active_sort(category);
        sort_pools(&mut self.pools, sort);
        self.pools.truncate(CATEGORY_LIST_CAPACITY);
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryLists {
    pub recent: Option<CategoryList>,
    pub about_to_graduate: Option<CategoryList>,
    pub graduated: Option<CategoryList>,
}

impl CategoryLists {
    pub fn get(&self, category: Category) -> Option<&CategoryList> {
        match category {
            Category::Recent => self.recent.as_ref(),
            Category::AboutToGraduate => self.about_to_graduate.as_ref(),
            Category::Graduated => self.graduated.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, category: Category) -> &mut Option<CategoryList> {
        match category {
            Category::Recent => &mut self.recent,
            Category::AboutToGraduate => &mut self.about_to_graduate,
            Category::Graduated => &mut self.graduated,
        }
    }

    pub fn set_sort(&mut self, category: Category, sort: Option<SortSpec>) {
        if let Some(list) = self.slot_mut(category) {
            list.sort = sort;
            list.finalize(category);
        }
    }
}

fn sort_value(pool: &Pool, field: SortField) -> Option<f64> {
    match field {
        SortField::CreatedAt => pool.created_at.map(|at| at.timestamp_millis() as f64),
        SortField::BondingCurve => pool.bonding_curve,
        SortField::Volume24h => pool.volume24h,
        SortField::MarketCap => pool.base_asset.mcap,
        SortField::Liquidity => pool.liquidity,
        SortField::GraduatedAt => pool
            .base_asset
            .graduated_at
            .map(|at| at.timestamp_millis() as f64),
    }
}

/// Orders two pools under `sort`; pools missing the value rank last.
pub fn compare_pools(left: &Pool, right: &Pool, sort: SortSpec) -> Ordering {
    match (sort_value(left, sort.field), sort_value(right, sort.field)) {
        (Some(lhs), Some(rhs)) => match sort.direction {
            SortDirection::Asc => lhs.total_cmp(&rhs),
            SortDirection::Desc => rhs.total_cmp(&lhs),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn sort_pools(pools: &mut [Pool], sort: SortSpec) {
    pools.sort_by(|left, right| compare_pools(left, right, sort));
}

fn apply_update(lists: &mut CategoryLists, update: &PoolUpdate) {
    let pool = update.pool();
    if let PoolUpdate::Update(_) = update {
        if pool.is_unreliable() {
            debug!(pool_id = %pool.id, "dropping unreliable pool update");
            return;
        }
    }
    // Pools already listed as graduated are never re-admitted elsewhere.
    let in_graduated = lists
        .graduated
        .as_ref()
        .is_some_and(|list| list.contains(&pool.id));

    match update {
        PoolUpdate::New(pool) => {
            if let Some(recent) = lists.recent.as_mut() {
                if in_graduated {
                    recent.patch(pool);
                } else {
                    recent.patch_or_append(pool);
                }
            }
            if let Some(about) = lists.about_to_graduate.as_mut() {
                about.patch_or_admit(pool, in_graduated);
            }
        }
        PoolUpdate::Update(pool) => {
            if let Some(recent) = lists.recent.as_mut() {
                recent.patch(pool);
            }
            if let Some(graduated) = lists.graduated.as_mut() {
                graduated.patch(pool);
            }
            if let Some(about) = lists.about_to_graduate.as_mut() {
                about.patch_or_admit(pool, in_graduated);
            }
        }
        PoolUpdate::Graduated(pool) => {
            if let Some(graduated) = lists.graduated.as_mut() {
                graduated.patch_or_append(pool);
            }
            if let Some(recent) = lists.recent.as_mut() {
                recent.remove(&pool.id);
            }
            if let Some(about) = lists.about_to_graduate.as_mut() {
                about.remove(&pool.id);
            }
        }
    }
}

/// Events apply one at a time in batch order; sorting and truncation run once
/// at the end.
pub fn reconcile(mut lists: CategoryLists, batch: &[PoolUpdate]) -> CategoryLists {
    for update in batch {
        apply_update(&mut lists, update);
    }

    for category in [
        Category::Recent,
        Category::AboutToGraduate,
        Category::Graduated,
    ] {
        if let Some(list) = lists.slot_mut(category) {
            list.finalize(category);
        }
    }

    lists
}
