//! Firewall export: pushes derived table membership into the packet filter.
//!
//! Every export is a full replace of each table's member set. The previous
//! set comes from the sink when it can report one; otherwise it is taken
//! as empty, so every non-empty table is rewritten. A disabled exporter
//! never queries the sink and only logs.

use std::collections::BTreeSet;

use crate::collaborators::FirewallTableSink;
use crate::table::TableMembership;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub tables: usize,
    pub replaced: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct FirewallExporter {
    enabled: bool,
    debug: bool,
}

impl FirewallExporter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Reconcile every table in `membership` into `sink`.
    ///
    /// A failing table is logged and skipped; the rest still go out.
    pub async fn export(
        &self,
        membership: &TableMembership,
        sink: &mut dyn FirewallTableSink,
    ) -> ExportStats {
        let mut stats = ExportStats {
            tables: membership.len(),
            ..ExportStats::default()
        };

        for (table, desired) in membership {
            let previous = if self.enabled {
                sink.current_table(table).await.unwrap_or_default()
            } else {
                BTreeSet::new()
            };
            let adds = desired.difference(&previous).count();
            let removes = previous.difference(desired).count();

            if self.debug || adds + removes > 0 {
                tracing::info!(table = %table, adds, removes, "firewall table delta");
            }
            if adds + removes == 0 {
                continue;
            }
            if !self.enabled {
                tracing::debug!(table = %table, "firewall updates disabled");
                continue;
            }

            match sink.replace_table(table, desired).await {
                Ok(()) => stats.replaced += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(table = %table, error = %e, "firewall table replace failed");
                }
            }
        }
        stats
    }
}
