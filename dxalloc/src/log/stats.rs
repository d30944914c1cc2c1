//! This module records statistics about register allocation. In non-testing mode, statistics are
//! only recorded if the environment variable `DXALLOC_LOG_STATS` is set to a path (or `-` for
//! stderr).

use parking_lot::Mutex;
#[cfg(not(test))]
use std::env;
use std::{
    fs,
    ops::DerefMut,
    time::{Duration, Instant},
};

pub(crate) struct Stats {
    // Most runs won't record statistics: the outer `Option` makes the "are stats enabled?" check a
    // simple null check, and only if they are do we pay for locking the `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many methods have had their registers allocated successfully?
    methods_allocated: u64,
    /// How many methods failed allocation?
    methods_failed: u64,
    /// How many times was an allocation attempt discarded and restarted?
    restarts: u64,
    /// How many register to register moves were inserted?
    spill_moves: u64,
    /// How many rematerialised constants were inserted?
    rematerializations: u64,
    /// How many temporary registers were needed to break move cycles?
    temporaries: u64,
    /// How many arguments were unsplit after an exhaustive allocation?
    arguments_unsplit: u64,
    /// The total number of registers used by all allocated methods.
    registers: u64,
    /// The wall-clock time spent allocating.
    duration_allocating: Duration,
}

impl Stats {
    #[cfg(not(test))]
    pub fn new() -> Self {
        if let Ok(p) = env::var("DXALLOC_LOG_STATS") {
            Self {
                inner: Some(Mutex::new(StatsInner::new(p))),
            }
        } else {
            Self { inner: None }
        }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If statistics are enabled, update `inner` by running the function `f`, otherwise return
    /// immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            let mut lk = mtx.lock();
            f(lk.deref_mut());
        }
    }

    /// Record the outcome of allocating one method, which started at `start`.
    pub fn method_allocated(&self, ok: bool, start: Instant) {
        self.update_with(|inner| {
            if ok {
                inner.methods_allocated += 1;
            } else {
                inner.methods_failed += 1;
            }
            inner.duration_allocating = inner
                .duration_allocating
                .saturating_add(Instant::now().saturating_duration_since(start));
        });
    }

    /// Increment the "an allocation attempt was restarted" count.
    pub fn restart(&self) {
        self.update_with(|inner| inner.restarts += 1);
    }

    /// Record the moves, rematerialisations, and temporaries a method's final allocation needed.
    pub fn moves_inserted(&self, spill_moves: u64, rematerializations: u64, temporaries: u64) {
        self.update_with(|inner| {
            inner.spill_moves += spill_moves;
            inner.rematerializations += rematerializations;
            inner.temporaries += temporaries;
        });
    }

    pub fn arguments_unsplit(&self, n: u64) {
        self.update_with(|inner| inner.arguments_unsplit += n);
    }

    pub fn registers(&self, n: u64) {
        self.update_with(|inner| inner.registers += n);
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            methods_allocated: 0,
            methods_failed: 0,
            restarts: 0,
            spill_moves: 0,
            rematerializations: 0,
            temporaries: 0,
            arguments_unsplit: 0,
            registers: 0,
            duration_allocating: Duration::new(0, 0),
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is sorted by field name so that textual
    /// matching of the JSON string is possible.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            ("methods_allocated", self.methods_allocated.to_string()),
            ("methods_failed", self.methods_failed.to_string()),
            ("restarts", self.restarts.to_string()),
            ("spill_moves", self.spill_moves.to_string()),
            ("rematerializations", self.rematerializations.to_string()),
            ("temporaries", self.temporaries.to_string()),
            ("arguments_unsplit", self.arguments_unsplit.to_string()),
            ("registers", self.registers.to_string()),
            (
                "duration_allocating",
                fmt_duration(self.duration_allocating),
            ),
        ];
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_is_sorted() {
        let s = Stats::new();
        s.restart();
        s.moves_inserted(3, 1, 1);
        s.moves_inserted(2, 0, 0);
        s.registers(7);
        let Some(inner) = &s.inner else { panic!() };
        let json = inner.lock().to_json();
        let keys = json
            .lines()
            .filter_map(|l| l.trim().strip_prefix('"'))
            .filter_map(|l| l.split('"').next())
            .collect::<Vec<_>>();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 9);
        for x in [
            r#""registers": 7,"#,
            r#""restarts": 1,"#,
            r#""spill_moves": 5,"#,
            r#""temporaries": 1"#,
        ] {
            assert!(json.contains(x), "{json}");
        }
    }
}
