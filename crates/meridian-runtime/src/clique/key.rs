use meridian_device::GlobalDeviceId;
use std::cmp::Ordering;
use std::fmt;

/// Execution property that keeps otherwise identical cliques apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CliqueStreamKind {
    /// Operations issued directly on execution streams
    Compute,
    /// Operations recorded into a replayable command buffer
    CommandBuffer,
}

impl fmt::Display for CliqueStreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliqueStreamKind::Compute => f.write_str("compute"),
            CliqueStreamKind::CommandBuffer => f.write_str("command_buffer"),
        }
    }
}

/// Identity of a clique: the ordered participant set plus a stream kind
///
/// Position in `devices` is the participant's rank. Keys order by
/// descending participant count, then by devices, then by stream kind.
/// Acquiring cliques in this order on every process rules out circular
/// waits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CliqueKey {
    devices: Vec<GlobalDeviceId>,
    stream_kind: CliqueStreamKind,
}

impl CliqueKey {
    pub fn new(devices: impl Into<Vec<GlobalDeviceId>>, stream_kind: CliqueStreamKind) -> Self {
        Self {
            devices: devices.into(),
            stream_kind,
        }
    }

    pub fn compute(devices: impl Into<Vec<GlobalDeviceId>>) -> Self {
        Self::new(devices, CliqueStreamKind::Compute)
    }

    pub fn devices(&self) -> &[GlobalDeviceId] {
        &self.devices
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn stream_kind(&self) -> CliqueStreamKind {
        self.stream_kind
    }

    pub fn rank_of(&self, device: GlobalDeviceId) -> Option<usize> {
        self.devices.iter().position(|d| *d == device)
    }

    /// Name every process derives identically for a given run
    pub fn rendezvous_name(&self, run_id: super::RunId) -> String {
        format!("{self}/{run_id}")
    }
}

impl Ord for CliqueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .devices
            .len()
            .cmp(&self.devices.len())
            .then_with(|| self.devices.cmp(&other.devices))
            .then_with(|| self.stream_kind.cmp(&other.stream_kind))
    }
}

impl PartialOrd for CliqueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CliqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("clique[")?;
        for (i, device) in self.devices.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", device.0)?;
        }
        write!(f, ";{}]", self.stream_kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clique::RunId;

    fn ids(raw: &[u64]) -> Vec<GlobalDeviceId> {
        raw.iter().copied().map(GlobalDeviceId).collect()
    }

    #[test]
    fn larger_cliques_sort_first() {
        let mut keys = vec![
            CliqueKey::compute(ids(&[0, 1])),
            CliqueKey::compute(ids(&[0, 1, 2, 3])),
            CliqueKey::new(ids(&[0, 1]), CliqueStreamKind::CommandBuffer),
            CliqueKey::compute(ids(&[2, 3])),
        ];
        keys.sort();
        assert_eq!(keys[0].num_devices(), 4);
        assert_eq!(keys[1], CliqueKey::compute(ids(&[0, 1])));
        assert_eq!(keys[2].stream_kind(), CliqueStreamKind::CommandBuffer);
        assert_eq!(keys[3], CliqueKey::compute(ids(&[2, 3])));
    }

    #[test]
    fn rank_follows_device_position() {
        let key = CliqueKey::compute(ids(&[7, 3, 5]));
        assert_eq!(key.rank_of(GlobalDeviceId(3)), Some(1));
        assert_eq!(key.rank_of(GlobalDeviceId(4)), None);
    }

    #[test]
    fn rendezvous_name_is_stable() {
        let key = CliqueKey::compute(ids(&[0, 1]));
        assert_eq!(key.rendezvous_name(RunId(9)), "clique[0,1;compute]/run:9");
    }
}
