use std::time::Duration;

use threadwire_protocol::{Buffer, TransferDescriptor, Value};
use threadwire_worker::{Api, Args};

fn arg<T>(args: &Args, index: usize) -> Result<T, String>
where
    T: TryFrom<Value, Error = threadwire_protocol::ValueError>,
{
    args.arg(index).map_err(|error| error.to_string())
}

/// The methods served by `threadwire worker`.
pub fn api() -> Api {
    Api::new()
        .function("helloWorld", |_| Ok::<_, String>("Hello World!"))
        .function("echo", |args: Args| {
            let value = args.get(0).cloned().unwrap_or(Value::Null);
            let payload = match value {
                Value::Buffer(buffer) => TransferDescriptor::buffer(buffer).into(),
                value => value.into(),
            };
            Ok::<threadwire_protocol::Payload, String>(payload)
        })
        .function("sum", |args: Args| {
            let mut sum = 0i64;
            for index in 0..args.len() {
                let value: i64 = arg(&args, index)?;
                sum = sum.checked_add(value).ok_or("integer overflow")?;
            }
            Ok::<_, String>(sum)
        })
        .method("sleep", |args: Args| async move {
            let millis: i64 = arg(&args, 0)?;
            let millis = u64::try_from(millis).map_err(|_| "duration must not be negative")?;
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, String>(millis as i64)
        })
        .function("fill", |args: Args| {
            let len: i64 = arg(&args, 0)?;
            let byte: i64 = arg(&args, 1)?;
            let len = usize::try_from(len).map_err(|_| "length must not be negative")?;
            let byte = u8::try_from(byte).map_err(|_| "byte must be in 0..=255")?;
            Ok::<_, String>(TransferDescriptor::buffer(Buffer::new(vec![byte; len])))
        })
        .function("fail", |args: Args| {
            let message = args
                .get(0)
                .and_then(Value::as_str)
                .unwrap_or("boom")
                .to_owned();
            Err::<(), _>(message)
        })
}
