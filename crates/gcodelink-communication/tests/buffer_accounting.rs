//! Property tests for Grbl receive-buffer accounting

use gcodelink_communication::{DeviceProtocol, DeviceResponse, GrblDevice};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Send(String),
    Ok,
    Error,
    Status,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        "[A-Z][0-9 .XYZF-]{0,40}".prop_map(Op::Send),
        Just(Op::Ok),
        Just(Op::Error),
        Just(Op::Status),
    ]
}

proptest! {
    #[test]
    fn in_flight_total_matches_fifo(ops in prop::collection::vec(op(), 0..64)) {
        let mut device = GrblDevice::default();
        let mut model: Vec<usize> = Vec::new();

        for op in ops {
            match op {
                Op::Send(line) => {
                    let bytes = device.encode(&line, true);
                    model.push(bytes.len());
                }
                Op::Ok => {
                    prop_assert_eq!(device.decode("ok"), DeviceResponse::Ack);
                    if !model.is_empty() {
                        model.remove(0);
                    }
                }
                Op::Error => {
                    let retired = device.decode("error:9");
                    prop_assert!(retired.retires_line());
                    if !model.is_empty() {
                        model.remove(0);
                    }
                }
                Op::Status => {
                    let before = device.bytes_in_flight();
                    device.decode("<Idle|MPos:0.000,0.000,0.000|FS:0,0>");
                    prop_assert_eq!(device.bytes_in_flight(), before);
                }
            }

            let fifo: Vec<usize> = device.in_flight().collect();
            prop_assert_eq!(&fifo, &model);
            prop_assert_eq!(device.bytes_in_flight(), fifo.iter().sum::<usize>());
        }
    }

    #[test]
    fn ok_to_send_matches_watermark(in_flight in 0usize..114, candidate in "[A-Z0-9]{0,120}") {
        let mut device = GrblDevice::default();
        if in_flight > 0 {
            // one line of `in_flight` bytes including its newline
            device.encode(&"G".repeat(in_flight - 1), true);
        }
        prop_assert_eq!(device.bytes_in_flight(), in_flight);

        let size = candidate.trim_end().len() + 1;
        prop_assert_eq!(device.ok_to_send(&candidate), in_flight + size <= 114);
        prop_assert_eq!(device.bytes_in_flight(), in_flight);
    }

    #[test]
    fn ok_retires_exactly_the_encoded_length(line in "[A-Z][A-Z0-9 .]{0,60}") {
        let mut device = GrblDevice::default();
        device.encode("G4 P0", true);
        let before = device.bytes_in_flight();
        let encoded = device.encode(&line, true).len();
        prop_assert_eq!(device.bytes_in_flight(), before + encoded);

        device.decode("ok\n");
        prop_assert_eq!(device.lines_in_flight(), 1);
        prop_assert_eq!(device.bytes_in_flight(), encoded);
    }
}
