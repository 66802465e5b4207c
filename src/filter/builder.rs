use crate::catalog::types::Value;
use crate::error::GateError;
use crate::filter::input::FieldFilter;
use crate::filter::{FilterCondition, FilterGroup, FilterOperator, FilterValue, GroupLogic};
use std::collections::BTreeSet;

/// Accumulates filter groups from successive caller calls.
///
/// Consecutive single-field AND-mode calls land in one accumulating group so
/// the compilers see a shallow list of groups.
#[derive(Debug, Clone, Default)]
pub struct FilterGroupBuilder {
    groups: Vec<FilterGroup>,
    /// Index of the AND group currently absorbing single-field calls.
    open_and_group: Option<usize>,
    /// Location (group, condition) of the installed ids condition.
    ids_condition: Option<(usize, usize)>,
}

impl FilterGroupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field_filter(
        &mut self,
        field: &str,
        filter: FieldFilter,
        list_logic: GroupLogic,
    ) -> Result<(), GateError> {
        let is_list = filter.is_list();
        let conditions = filter.into_conditions(field)?;
        if is_list && list_logic == GroupLogic::Or && conditions.len() > 1 {
            self.open_and_group = None;
            self.groups.push(FilterGroup::or(conditions));
            return Ok(());
        }
        self.extend_open_group(conditions);
        Ok(())
    }

    pub fn add_condition(&mut self, condition: FilterCondition) {
        self.extend_open_group(vec![condition]);
    }

    /// Appends a caller-built group as-is and closes the accumulating group.
    pub fn add_group(&mut self, group: FilterGroup) {
        if group.is_empty() {
            return;
        }
        self.open_and_group = None;
        self.groups.push(group);
    }

    /// Restricts results to `ids`. Repeated calls union into the one ids
    /// condition instead of stacking another clause. Returns the ids now in
    /// effect: de-duplicated, first-seen order, contiguous.
    pub fn add_ids_filter(&mut self, id_field: &str, ids: &[Value]) -> Result<Vec<Value>, GateError> {
        if let Some((group_idx, cond_idx)) = self.ids_condition {
            let condition = &mut self.groups[group_idx].conditions[cond_idx];
            let merged = match &condition.value {
                FilterValue::List(existing) => dedup_ids(existing.iter().chain(ids.iter())),
                _ => dedup_ids(ids.iter()),
            };
            condition.value = FilterValue::List(merged.clone());
            return Ok(merged);
        }
        let unique = dedup_ids(ids.iter());
        if unique.is_empty() {
            return Err(GateError::InvalidFilter("ids filter needs at least one id".into()));
        }
        let condition = FilterCondition::new(
            id_field,
            FilterOperator::In,
            FilterValue::List(unique.clone()),
        )?;
        self.extend_open_group(vec![condition]);
        let group_idx = self.open_and_group.unwrap_or(self.groups.len() - 1);
        let cond_idx = self.groups[group_idx].conditions.len() - 1;
        self.ids_condition = Some((group_idx, cond_idx));
        Ok(unique)
    }

    pub fn ids_applied(&self) -> bool {
        self.ids_condition.is_some()
    }

    pub fn groups(&self) -> &[FilterGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(FilterGroup::is_empty)
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.open_and_group = None;
        self.ids_condition = None;
    }

    fn extend_open_group(&mut self, conditions: Vec<FilterCondition>) {
        match self.open_and_group {
            Some(idx) => self.groups[idx].conditions.extend(conditions),
            None => {
                self.groups.push(FilterGroup::and(conditions));
                self.open_and_group = Some(self.groups.len() - 1);
            }
        }
    }
}

fn dedup_ids<'a, I: Iterator<Item = &'a Value>>(ids: I) -> Vec<Value> {
    let mut seen = BTreeSet::new();
    ids.filter(|id| !id.is_null() && seen.insert((*id).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::FilterGroupBuilder;
    use crate::catalog::types::Value;
    use crate::filter::input::FieldFilter;
    use crate::filter::{FilterOperator, FilterValue, GroupLogic};

    #[test]
    fn consecutive_and_calls_share_one_group() {
        let mut builder = FilterGroupBuilder::new();
        builder
            .add_field_filter("status", FieldFilter::eq("active"), GroupLogic::And)
            .expect("status");
        builder
            .add_field_filter("price", FieldFilter::range(10, 20), GroupLogic::And)
            .expect("price");
        assert_eq!(builder.groups().len(), 1);
        assert_eq!(builder.groups()[0].conditions.len(), 2);
    }

    #[test]
    fn or_list_opens_its_own_group_and_closes_accumulation() {
        let mut builder = FilterGroupBuilder::new();
        builder
            .add_field_filter("status", FieldFilter::eq("active"), GroupLogic::And)
            .expect("status");
        builder
            .add_field_filter(
                "name",
                FieldFilter::OperatorList(vec![
                    (FilterOperator::Like, FilterValue::Scalar("a*".into())),
                    (FilterOperator::Like, FilterValue::Scalar("b*".into())),
                ]),
                GroupLogic::Or,
            )
            .expect("name");
        builder
            .add_field_filter("brand", FieldFilter::eq("acme"), GroupLogic::And)
            .expect("brand");
        let groups = builder.groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].logic, GroupLogic::Or);
        assert_eq!(groups[2].conditions[0].field, "brand");
    }

    #[test]
    fn ids_filter_unions_and_dedups_on_repeat() {
        let mut twice = FilterGroupBuilder::new();
        twice
            .add_ids_filter("id", &[Value::Integer(3), Value::Integer(1), Value::Integer(3)])
            .expect("first");
        let ids = twice
            .add_ids_filter("id", &[Value::Integer(1), Value::Integer(7)])
            .expect("second");
        assert_eq!(ids, vec![Value::Integer(3), Value::Integer(1), Value::Integer(7)]);

        let mut once = FilterGroupBuilder::new();
        once.add_ids_filter(
            "id",
            &[Value::Integer(3), Value::Integer(1), Value::Integer(7)],
        )
        .expect("once");
        assert_eq!(twice.groups(), once.groups());
    }

    #[test]
    fn clear_resets_ids_flag() {
        let mut builder = FilterGroupBuilder::new();
        builder.add_ids_filter("id", &[Value::Integer(1)]).expect("ids");
        assert!(builder.ids_applied());
        builder.clear();
        assert!(!builder.ids_applied());
        assert!(builder.is_empty());
    }
}
