//! SMT sibling topology.
//!
//! Parses sysfs at startup to map each physical core to its pair of sibling
//! logical CPUs. Pair scheduling assumes two-way SMT throughout; detection
//! fails on anything else.

use std::fmt;

use anyhow::{bail, Result};
use log::info;

/// Physical-core to sibling-thread map.
#[derive(Debug, Clone)]
pub struct Topology {
    /// `siblings[core] = (first logical CPU, second logical CPU)`.
    pub siblings: Vec<(usize, usize)>,
}

impl Topology {
    /// Detect the sibling map from sysfs.
    pub fn detect() -> Result<Self> {
        let mut groups: Vec<Vec<usize>> = Vec::new();

        for cpu in 0.. {
            let path =
                format!("/sys/devices/system/cpu/cpu{cpu}/topology/thread_siblings_list");
            let content = match std::fs::read_to_string(&path) {
                Ok(s) => s,
                Err(_) => break,
            };
            let members = parse_cpu_list(content.trim());
            if members.is_empty() {
                continue;
            }
            if !groups.contains(&members) {
                groups.push(members);
            }
        }

        if groups.is_empty() {
            bail!("no CPUs visible under /sys/devices/system/cpu");
        }

        let mut siblings = Vec::with_capacity(groups.len());
        for members in &groups {
            if members.len() != 2 {
                bail!(
                    "SMT sibling group {:?} has {} threads; two-way SMT is required",
                    members,
                    members.len()
                );
            }
            siblings.push((members[0], members[1]));
        }
        siblings.sort();

        Ok(Topology { siblings })
    }

    /// Fixed-shape topology for tests and benchmarks: core `i` owns logical
    /// CPUs `2i` and `2i + 1`.
    pub fn synthetic(nr_cores: usize) -> Self {
        Topology {
            siblings: (0..nr_cores).map(|i| (2 * i, 2 * i + 1)).collect(),
        }
    }

    pub fn nr_physical(&self) -> usize {
        self.siblings.len()
    }

    pub fn nr_logical(&self) -> usize {
        self.siblings.len() * 2
    }

    pub fn log_summary(&self) {
        for (core, (a, b)) in self.siblings.iter().enumerate() {
            info!("topology: core {core}: siblings [{a},{b}]");
        }
        info!(
            "topology: {} physical cores, {} logical CPUs",
            self.nr_physical(),
            self.nr_logical()
        );
    }
}

/// Parse the kernel cpulist format: "0,6", "0-2,6-8", "3".
pub fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut result = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(s), Ok(e)) = (start.parse::<usize>(), end.parse::<usize>()) {
                result.extend(s..=e);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            result.push(cpu);
        }
    }
    result.sort();
    result.dedup();
    result
}

/// A logical-CPU bitmap over u64 words, sized to the machine.
#[derive(Clone, PartialEq, Eq)]
pub struct Cpumask {
    nr_cpus: usize,
    words: Vec<u64>,
}

impl Cpumask {
    pub fn new(nr_cpus: usize) -> Self {
        Cpumask {
            nr_cpus,
            words: vec![0; nr_cpus.div_ceil(64)],
        }
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < self.nr_cpus {
            self.words[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    pub fn test(&self, cpu: usize) -> bool {
        cpu < self.nr_cpus && self.words[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    pub fn weight(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nr_cpus).filter(|cpu| self.test(*cpu))
    }
}

impl fmt::Debug for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpus: Vec<String> = self.iter().map(|c| c.to_string()).collect();
        write!(f, "Cpumask[{}]", cpus.join(","))
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, word) in self.words.iter().enumerate().rev() {
            if i == self.words.len() - 1 {
                write!(f, "{word:x}")?;
            } else {
                write!(f, ",{word:016x}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single() {
        assert_eq!(parse_cpu_list("3"), vec![3]);
    }

    #[test]
    fn parse_comma() {
        assert_eq!(parse_cpu_list("0,6"), vec![0, 6]);
    }

    #[test]
    fn parse_range() {
        assert_eq!(parse_cpu_list("0-2,6-8"), vec![0, 1, 2, 6, 7, 8]);
    }

    #[test]
    fn parse_mixed() {
        assert_eq!(parse_cpu_list("0-2,5,9-11"), vec![0, 1, 2, 5, 9, 10, 11]);
    }

    #[test]
    fn parse_empty() {
        assert_eq!(parse_cpu_list(""), Vec::<usize>::new());
    }

    #[test]
    fn synthetic_shape() {
        let topo = Topology::synthetic(4);
        assert_eq!(topo.nr_physical(), 4);
        assert_eq!(topo.nr_logical(), 8);
        assert_eq!(topo.siblings[2], (4, 5));
    }

    #[test]
    fn cpumask_ops() {
        let mut mask = Cpumask::new(16);
        assert!(mask.is_empty());
        mask.set(0);
        mask.set(9);
        mask.set(99); // out of range, ignored
        assert!(mask.test(0));
        assert!(mask.test(9));
        assert!(!mask.test(1));
        assert_eq!(mask.weight(), 2);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn cpumask_equality_for_idempotence_checks() {
        let mut a = Cpumask::new(8);
        let mut b = Cpumask::new(8);
        a.set(3);
        b.set(3);
        assert_eq!(a, b);
        b.set(4);
        assert_ne!(a, b);
    }
}
