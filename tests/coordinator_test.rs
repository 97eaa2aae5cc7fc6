// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tests for response ordering, response fusion and stall reporting

mod common;

use std::time::{Duration, Instant};

use corral::config::EngineConfig;
use corral::coordinator::{fuse_responses, Coordinator, MessageTable};
use corral::data_types::DataType;
use corral::message::{Request, RequestList, RequestType, ResponseList, ResponseType};
use corral::timeline::ActivityRecorder;

use common::request;

fn lists_for(world_size: usize, names: &[&str], order_for_rank: impl Fn(usize) -> Vec<usize>) -> Vec<RequestList> {
    (0..world_size)
        .map(|rank| RequestList {
            requests: order_for_rank(rank)
                .into_iter()
                .map(|idx| request(rank, names[idx], RequestType::Allreduce, DataType::Float32, vec![10]))
                .collect(),
            shutdown: false,
        })
        .collect()
}

fn names_of(list: &ResponseList) -> Vec<Vec<String>> {
    list.responses.iter().map(|r| r.tensor_names.clone()).collect()
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_ready_names_emitted_in_lexicographic_order() {
    let config = EngineConfig::default().with_fusion_threshold(0);
    let names = ["delta", "alpha", "charlie", "bravo"];

    let mut first = Coordinator::new(3, &config);
    let forward = first.process(lists_for(3, &names, |_| vec![0, 1, 2, 3]));

    let mut second = Coordinator::new(3, &config);
    let shuffled = second.process(lists_for(3, &names, |rank| match rank {
        0 => vec![3, 2, 1, 0],
        1 => vec![1, 3, 0, 2],
        _ => vec![2, 0, 3, 1],
    }));

    let expected = vec![
        vec!["alpha".to_string()],
        vec!["bravo".to_string()],
        vec!["charlie".to_string()],
        vec!["delta".to_string()],
    ];
    assert_eq!(names_of(&forward), expected);
    assert_eq!(names_of(&shuffled), expected);
}

#[test]
fn test_incomplete_names_carry_over_between_rounds() {
    let config = EngineConfig::default();
    let mut coordinator = Coordinator::new(2, &config);

    let round1 = coordinator.process(vec![
        RequestList {
            requests: vec![request(0, "w", RequestType::Allreduce, DataType::Float32, vec![4])],
            shutdown: false,
        },
        RequestList::default(),
    ]);
    assert!(round1.responses.is_empty());
    assert!(coordinator.message_table().contains("w"));

    let round2 = coordinator.process(vec![
        RequestList::default(),
        RequestList {
            requests: vec![request(1, "w", RequestType::Allreduce, DataType::Float32, vec![4])],
            shutdown: false,
        },
    ]);
    assert_eq!(names_of(&round2), vec![vec!["w".to_string()]]);
    assert!(coordinator.message_table().is_empty());
}

#[test]
fn test_error_response_survives_encoding() {
    let config = EngineConfig::default();
    let mut coordinator = Coordinator::new(2, &config);
    let list = coordinator.process(vec![
        RequestList {
            requests: vec![request(0, "grad1", RequestType::Allreduce, DataType::Float32, vec![1000])],
            shutdown: false,
        },
        RequestList {
            requests: vec![request(1, "grad1", RequestType::Allgather, DataType::Float16, vec![1000])],
            shutdown: false,
        },
    ]);
    assert_eq!(list.responses.len(), 1);
    assert_eq!(list.responses[0].response_type, ResponseType::Error);

    let decoded = ResponseList::decode(&list.encode().unwrap()).unwrap();
    assert_eq!(decoded, list);
}

#[test]
fn test_shutdown_from_any_rank_propagates() {
    let config = EngineConfig::default();
    let mut coordinator = Coordinator::new(3, &config);
    let mut lists = vec![RequestList::default(); 3];
    let quiet = coordinator.process(lists.clone());
    assert!(!quiet.shutdown);

    lists[2].shutdown = true;
    let list = coordinator.process(lists);
    assert!(list.shutdown);
}

// =============================================================================
// Fusion
// =============================================================================

fn ready_tensors(requests: Vec<Vec<Request>>) -> Vec<corral::coordinator::ReadyTensor> {
    let world_size = requests[0].len();
    let mut table = MessageTable::new(world_size);
    let mut ready = Vec::new();
    for per_rank in requests {
        let name = per_rank[0].tensor_name.clone();
        for r in per_rank {
            table.record(r).unwrap();
        }
        ready.push(table.construct_response(&name).unwrap());
    }
    ready
}

fn single_rank(name: &str, request_type: RequestType, dtype: DataType, dims: Vec<i64>) -> Vec<Request> {
    vec![request(0, name, request_type, dtype, dims)]
}

#[test]
fn test_fusion_respects_threshold() {
    // 40 bytes each
    let ready = ready_tensors(vec![
        single_rank("a", RequestType::Allreduce, DataType::Float32, vec![10]),
        single_rank("b", RequestType::Allreduce, DataType::Float32, vec![10]),
        single_rank("c", RequestType::Allreduce, DataType::Float32, vec![10]),
    ]);

    let fused = fuse_responses(ready, 100);
    assert_eq!(fused.len(), 2);
    assert_eq!(fused[0].tensor_names, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(fused[1].tensor_names, vec!["c".to_string()]);
}

#[test]
fn test_zero_threshold_keeps_tensors_apart() {
    let ready = ready_tensors(vec![
        single_rank("a", RequestType::Allreduce, DataType::Float32, vec![0]),
        single_rank("b", RequestType::Allreduce, DataType::Float32, vec![0]),
    ]);

    let fused = fuse_responses(ready, 0);
    assert_eq!(fused.len(), 2);
    assert_eq!(fused[0].tensor_names, vec!["a".to_string()]);
    assert_eq!(fused[1].tensor_names, vec!["b".to_string()]);
}

#[test]
fn test_fusion_only_joins_same_type_and_dtype() {
    let ready = ready_tensors(vec![
        single_rank("a", RequestType::Allreduce, DataType::Float32, vec![4]),
        single_rank("b", RequestType::Allreduce, DataType::Int32, vec![4]),
        single_rank("c", RequestType::Broadcast, DataType::Int32, vec![4]),
        single_rank("d", RequestType::Broadcast, DataType::Int32, vec![4]),
        single_rank("e", RequestType::Allreduce, DataType::Int32, vec![4]),
    ]);

    let fused = fuse_responses(ready, 1 << 20);
    let names: Vec<Vec<String>> = fused.iter().map(|r| r.tensor_names.clone()).collect();
    assert_eq!(
        names,
        vec![
            vec!["a".to_string()],
            vec!["b".to_string()],
            vec!["c".to_string()],
            vec!["d".to_string()],
            vec!["e".to_string()],
        ]
    );
}

#[test]
fn test_allgather_fusion_concatenates_sizes() {
    let ready = ready_tensors(vec![
        vec![
            request(0, "x", RequestType::Allgather, DataType::Int32, vec![1, 2]),
            request(1, "x", RequestType::Allgather, DataType::Int32, vec![3, 2]),
        ],
        vec![
            request(0, "y", RequestType::Allgather, DataType::Int32, vec![4]),
            request(1, "y", RequestType::Allgather, DataType::Int32, vec![2]),
        ],
    ]);

    let fused = fuse_responses(ready, 1 << 20);
    assert_eq!(fused.len(), 1);
    assert_eq!(fused[0].response_type, ResponseType::Allgather);
    assert_eq!(fused[0].tensor_names, vec!["x".to_string(), "y".to_string()]);
    assert_eq!(fused[0].tensor_sizes, vec![1, 3, 4, 2]);
}

// =============================================================================
// Stall inspection
// =============================================================================

#[test]
fn test_stall_warning_rate_limited() {
    let recorder = ActivityRecorder::new();
    let config = EngineConfig::default()
        .with_stall_warning_time(Duration::from_secs(60))
        .with_activity_sink(recorder.clone());
    let mut coordinator = Coordinator::new(4, &config);

    let t0 = Instant::now();
    let lists: Vec<RequestList> = (0..4)
        .map(|rank| RequestList {
            requests: if rank == 2 {
                Vec::new()
            } else {
                vec![request(rank, "grad1", RequestType::Allreduce, DataType::Float32, vec![1000])]
            },
            shutdown: false,
        })
        .collect();
    let list = coordinator.process_at(lists, t0);
    assert!(list.responses.is_empty());
    assert!(recorder.stall_reports().is_empty());

    let list = coordinator.process_at(vec![RequestList::default(); 4], t0 + Duration::from_secs(61));
    assert!(list.responses.is_empty(), "a stalled tensor is never answered");
    let reports = recorder.stall_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].tensor_name, "grad1");
    assert_eq!(reports[0].missing_ranks, vec![2]);

    // the next inspection is a full interval away
    coordinator.process_at(vec![RequestList::default(); 4], t0 + Duration::from_secs(62));
    assert_eq!(recorder.stall_reports().len(), 1);
}

#[test]
fn test_stall_check_can_be_disabled() {
    let recorder = ActivityRecorder::new();
    let config = EngineConfig::default()
        .with_stall_check(false)
        .with_stall_warning_time(Duration::from_secs(1))
        .with_activity_sink(recorder.clone());
    let mut coordinator = Coordinator::new(2, &config);

    let t0 = Instant::now();
    coordinator.process_at(
        vec![
            RequestList {
                requests: vec![request(0, "w", RequestType::Allreduce, DataType::Float32, vec![4])],
                shutdown: false,
            },
            RequestList::default(),
        ],
        t0,
    );
    coordinator.process_at(vec![RequestList::default(); 2], t0 + Duration::from_secs(30));
    assert!(recorder.stall_reports().is_empty());
}
