use crate::config::SchedulingStrategy;
use drover_lib::{OnChainTask, TaskAddress};
use std::collections::{HashSet, VecDeque};

/// One admitted task waiting for (or holding) a worker slot.
#[derive(Debug, Clone)]
pub(crate) struct PipelineTask {
    pub task_address: TaskAddress,
    pub task: OnChainTask,
}

/// Bounded-by-backpressure FIFO of admitted tasks plus the in-flight
/// set. Size counts waiting tasks only: discovery adds one, a slot
/// acquisition removes one.
#[derive(Debug)]
pub(crate) struct TaskQueue {
    pending: VecDeque<PipelineTask>,
    /// Addresses waiting or in flight, for dedup.
    queued_keys: HashSet<TaskAddress>,
    in_flight: HashSet<TaskAddress>,
    strategy: SchedulingStrategy,
}

impl TaskQueue {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self {
            pending: VecDeque::new(),
            queued_keys: HashSet::new(),
            in_flight: HashSet::new(),
            strategy,
        }
    }

    pub fn size(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn contains(&self, task_address: &TaskAddress) -> bool {
        self.queued_keys.contains(task_address)
    }

    /// Admit a task. Duplicates of waiting or in-flight tasks are
    /// rejected.
    pub fn push(&mut self, task: PipelineTask) -> bool {
        if !self.queued_keys.insert(task.task_address) {
            return false;
        }
        self.pending.push_back(task);
        true
    }

    /// Hand the next task (per the scheduling strategy) to a worker
    /// slot, moving it into the in-flight set.
    pub fn try_next(&mut self) -> Option<PipelineTask> {
        let index = match self.strategy {
            SchedulingStrategy::Fifo => 0,
            SchedulingStrategy::Priority => self.earliest_deadline_index()?,
            SchedulingStrategy::RewardWeighted => self.largest_reward_index()?,
        };
        let task = self.pending.remove(index)?;
        self.in_flight.insert(task.task_address);
        Some(task)
    }

    fn earliest_deadline_index(&self) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            // deadline 0 means none: sort it after every real deadline
            .min_by_key(|(_, t)| match t.task.deadline {
                0 => u64::MAX,
                d => d,
            })
            .map(|(i, _)| i)
    }

    fn largest_reward_index(&self) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .max_by_key(|(_, t)| t.task.reward_amount)
            .map(|(i, _)| i)
    }

    /// Release a finished (or parked) task so the address can re-enter.
    pub fn complete(&mut self, task_address: &TaskAddress) {
        self.in_flight.remove(task_address);
        self.queued_keys.remove(task_address);
    }

    /// Drop every waiting task. In-flight entries drain through
    /// `complete` as their futures observe cancellation.
    pub fn clear(&mut self) {
        for task in self.pending.drain(..) {
            self.queued_keys.remove(&task.task_address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use drover_lib::{TaskStatus, TaskType};

    fn task(reward: u64, deadline: u64) -> OnChainTask {
        OnChainTask {
            task_id: B256::ZERO,
            creator: B256::ZERO,
            required_capabilities: 0,
            reward_amount: reward,
            max_workers: 1,
            current_workers: 0,
            status: TaskStatus::Open,
            task_type: TaskType::Exclusive,
            deadline,
            escrow: 0,
            required_completions: 1,
            completions: 0,
        }
    }

    fn item(byte: u8, reward: u64, deadline: u64) -> PipelineTask {
        PipelineTask {
            task_address: B256::from([byte; 32]),
            task: task(reward, deadline),
        }
    }

    #[test]
    fn test_fifo_order_and_dedup() {
        let mut queue = TaskQueue::new(SchedulingStrategy::Fifo);
        assert!(queue.push(item(1, 0, 0)));
        assert!(queue.push(item(2, 0, 0)));
        assert!(!queue.push(item(1, 0, 0)));
        assert_eq!(queue.size(), 2);

        let first = queue.try_next().unwrap();
        assert_eq!(first.task_address, B256::from([1u8; 32]));
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.in_flight(), 1);

        // still deduped while in flight
        assert!(!queue.push(item(1, 0, 0)));
        queue.complete(&first.task_address);
        assert!(queue.push(item(1, 0, 0)));
    }

    #[test]
    fn test_reward_weighted_pops_largest() {
        let mut queue = TaskQueue::new(SchedulingStrategy::RewardWeighted);
        queue.push(item(1, 10, 0));
        queue.push(item(2, 30, 0));
        queue.push(item(3, 20, 0));
        assert_eq!(queue.try_next().unwrap().task_address, B256::from([2u8; 32]));
        assert_eq!(queue.try_next().unwrap().task_address, B256::from([3u8; 32]));
    }

    #[test]
    fn test_priority_prefers_earliest_deadline() {
        let mut queue = TaskQueue::new(SchedulingStrategy::Priority);
        queue.push(item(1, 0, 0)); // no deadline: last
        queue.push(item(2, 0, 500));
        queue.push(item(3, 0, 100));
        assert_eq!(queue.try_next().unwrap().task_address, B256::from([3u8; 32]));
        assert_eq!(queue.try_next().unwrap().task_address, B256::from([2u8; 32]));
        assert_eq!(queue.try_next().unwrap().task_address, B256::from([1u8; 32]));
    }

    #[test]
    fn test_clear_releases_waiting_only() {
        let mut queue = TaskQueue::new(SchedulingStrategy::Fifo);
        queue.push(item(1, 0, 0));
        queue.push(item(2, 0, 0));
        let running = queue.try_next().unwrap();

        queue.clear();
        assert_eq!(queue.size(), 0);
        assert!(queue.contains(&running.task_address));
        assert!(queue.push(item(2, 0, 0)));
    }
}
