use std::collections::VecDeque;

use crate::customer::{Customer, CustomerStore};
use crate::rules::RuleNode;

/// Resolves a campaign's audience by streaming the customer store through
/// the rule tree one page at a time. Audience size is unbounded relative to
/// memory, so the whole store is never materialized.
#[derive(Clone)]
pub struct AudienceSelector {
    customers: CustomerStore,
    page_size: u32,
}

impl AudienceSelector {
    pub fn new(customers: CustomerStore, page_size: u32) -> Self {
        AudienceSelector {
            customers,
            page_size: page_size.max(1),
        }
    }

    /// A fresh, restartable pass over the store. Calling this again starts
    /// over from the beginning; iteration itself has no side effects.
    pub fn select(&self, rules: &RuleNode) -> AudienceIter {
        AudienceIter {
            customers: self.customers.clone(),
            rules: rules.clone(),
            buffer: VecDeque::new(),
            after_id: 0,
            exhausted: false,
            page_size: self.page_size,
        }
    }

    /// Audience size without dispatching anything.
    pub fn preview_count(&self, rules: &RuleNode) -> anyhow::Result<usize> {
        let mut iter = self.select(rules);
        let mut n = 0;
        loop {
            match iter.try_next()? {
                Some(_) => n += 1,
                None => return Ok(n),
            }
        }
    }
}

pub struct AudienceIter {
    customers: CustomerStore,
    rules: RuleNode,
    buffer: VecDeque<Customer>,
    after_id: i64,
    exhausted: bool,
    page_size: u32,
}

impl AudienceIter {
    /// Next matching customer, or the storage error that stopped the scan.
    pub fn try_next(&mut self) -> anyhow::Result<Option<Customer>> {
        loop {
            while let Some(candidate) = self.buffer.pop_front() {
                if self.rules.evaluate(&candidate) {
                    return Ok(Some(candidate));
                }
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self.customers.page_after(self.after_id, self.page_size)?;
            if let Some(last) = page.last() {
                self.after_id = last.id;
            }
            if (page.len() as u32) < self.page_size {
                self.exhausted = true;
            }
            self.buffer.extend(page);
        }
    }
}

impl Iterator for AudienceIter {
    type Item = Customer;

    fn next(&mut self) -> Option<Customer> {
        match self.try_next() {
            Ok(item) => item,
            Err(e) => {
                log::error!("audience scan aborted: {e}");
                None
            }
        }
    }
}
