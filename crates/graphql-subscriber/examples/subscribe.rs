//! Subscribe to a GraphQL endpoint and print events to stdout.
//!
//! ```sh
//! cargo run -p graphql-subscriber --example subscribe -- \
//!     wss://example.com/graphql 'subscription { tick }'
//! ```

use graphql_subscriber::{SubscriptionClient, Variables};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let url = args.first().ok_or("usage: subscribe <URL> <QUERY>")?;
    let query = args.get(1).ok_or("usage: subscribe <URL> <QUERY>")?;

    let client = SubscriptionClient::new(url.clone())
        .on_connected(|| eprintln!("[connected]"))
        .on_disconnected(|| eprintln!("[disconnected]"));

    let id = client
        .subscribe(query.clone(), Variables::new(), |msg| {
            Box::pin(async move {
                match msg.payload {
                    Some(payload) => println!("{payload}"),
                    None => println!("<empty {kind:?} frame>", kind = msg.kind),
                }
                Ok(())
            })
        })
        .await?;
    eprintln!("subscribed as {id}");

    client.run().await?;
    Ok(())
}
