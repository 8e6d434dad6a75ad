use anyhow::Result;

use stowage::types::{InlinePolicy, PrimitiveKind, RecordType, TypeTable, Value};
use stowage::Stowage;

#[tokio::main]
async fn main() -> Result<()> {
    let mut types = TypeTable::new();
    let point = types.register_record(
        RecordType::immutable("hello::Point")
            .field("x", PrimitiveKind::Int64)
            .field("y", PrimitiveKind::Int64),
    );

    // Create a file and store a point in it
    let mut store = Stowage::try_new("hello.stw", types, InlinePolicy::default()).await?;
    let origin = Value::record(&point, vec![Some(Value::Int64(3)), Some(Value::Int64(4))])?;
    store.write("origin", &origin)?;
    store.write("greeting", &Value::string("hello"))?;
    drop(store);

    // Open it again without telling it what a Point is
    let mut store =
        Stowage::try_open("hello.stw", TypeTable::new(), InlinePolicy::default()).await?;
    let read = store.read("origin")?;
    println!("origin: {}", read.as_ref().map(Value::to_string).unwrap_or_default());
    assert_eq!(store.read("greeting")?, Some(Value::string("hello")));

    for committed in store.committed()? {
        println!("{:>4} {}", committed.index, committed.datatype);
    }
    drop(store);

    std::fs::remove_file("hello.stw")?;
    Ok(())
}
