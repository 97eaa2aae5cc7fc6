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

//! Tests for the fusion buffer layout and copy round trip

mod common;

use corral::data_types::DataType;
use corral::error::Code;
use corral::fusion::{FusionBufferManager, FusionLayout};
use corral::tensor::{Device, TensorDescriptor, TensorShape, TensorTableEntry};

use common::{f32_entry, i32_entry};

#[test]
fn test_layout_is_contiguous_for_one_type() {
    let layout = FusionLayout::from_sizes(&[4, 8, 12], 4);
    assert_eq!(layout.len(), 3);
    assert_eq!(layout.offset(0), 0);
    assert_eq!(layout.offset(1), 4);
    assert_eq!(layout.offset(2), 12);
    assert_eq!(layout.total_bytes(), 24);
    assert_eq!(layout.num_elements(), 6);
}

#[test]
fn test_layout_aligns_offsets_to_element_size() {
    let layout = FusionLayout::from_sizes(&[3, 5, 0, 2], 4);
    assert_eq!(layout.offset(0), 0);
    assert_eq!(layout.offset(1), 4);
    assert_eq!(layout.offset(2), 12);
    assert_eq!(layout.offset(3), 12);
    assert_eq!(layout.total_bytes(), 16);
    for idx in 0..layout.len() {
        assert_eq!(layout.offset(idx) % 4, 0);
    }
}

#[test]
fn test_plan_rejects_mixed_types() {
    let entries = vec![
        f32_entry("a", vec![2], &[1.0, 2.0]),
        i32_entry("b", vec![2], &[1, 2]),
    ];
    let err = FusionLayout::plan(&entries).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = FusionLayout::plan(&[]).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[test]
fn test_round_trip_is_identity() {
    for sizes in [vec![1usize], vec![3, 0, 7], vec![16, 1, 1, 32, 5]] {
        let mut entries: Vec<TensorTableEntry> = sizes
            .iter()
            .enumerate()
            .map(|(idx, n)| {
                let values: Vec<f32> = (0..*n).map(|v| (idx * 100 + v) as f32).collect();
                f32_entry(&format!("t{}", idx), vec![*n as i64], &values)
            })
            .collect();

        let layout = FusionLayout::plan(&entries).unwrap();
        let mut manager = FusionBufferManager::new(64);
        let fence = manager.memcpy_in(Device::Cpu, &entries, &layout).unwrap();
        let buffer = fence.synchronize();
        assert_eq!(buffer.len(), layout.total_bytes());
        buffer.memcpy_out(&mut entries, &layout).unwrap();

        for entry in &entries {
            assert_eq!(entry.output, entry.input, "{} changed in the round trip", entry.tensor_name);
        }
    }
}

#[test]
fn test_buffer_presized_then_grown() {
    let mut manager = FusionBufferManager::new(1024);
    assert_eq!(manager.capacity(Device::Cpu), 0);

    let entries = vec![f32_entry("a", vec![4], &[1.0, 2.0, 3.0, 4.0])];
    let layout = FusionLayout::plan(&entries).unwrap();
    let _ = manager.memcpy_in(Device::Cpu, &entries, &layout).unwrap().synchronize();
    assert_eq!(manager.capacity(Device::Cpu), 1024);

    let big = vec![TensorTableEntry::new(
        "big",
        TensorDescriptor::new(DataType::UInt8, TensorShape::new(vec![4096]), vec![7u8; 4096]).unwrap(),
    )];
    let layout = FusionLayout::plan(&big).unwrap();
    let _ = manager.memcpy_in(Device::Cpu, &big, &layout).unwrap().synchronize();
    assert_eq!(manager.capacity(Device::Cpu), 4096);

    // each device has its own buffer
    assert_eq!(manager.capacity(Device::Gpu(0)), 0);
}

#[test]
fn test_buffer_cleared_between_batches() {
    let mut manager = FusionBufferManager::new(32);
    let entries = vec![i32_entry("a", vec![4], &[9, 9, 9, 9])];
    let layout = FusionLayout::plan(&entries).unwrap();
    let _ = manager.memcpy_in(Device::Cpu, &entries, &layout).unwrap().synchronize();

    let region = manager.receive_region(Device::Cpu, 16);
    assert!(region.data().iter().all(|b| *b == 0));
}

#[test]
fn test_memcpy_in_checks_layout() {
    let entries = vec![f32_entry("a", vec![2], &[1.0, 2.0])];
    let layout = FusionLayout::from_sizes(&[4], 4);
    let mut manager = FusionBufferManager::new(16);
    let err = manager.memcpy_in(Device::Cpu, &entries, &layout).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}
